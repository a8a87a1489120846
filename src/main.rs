use prompt_lens::{
    extract_from_bytes, extract_from_parameter_text, is_png_source, ExtractedMetadata,
    HttpByteSource, MetadataExtractor,
};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;
use walkdir::WalkDir;

fn usage() {
    println!("Extract AI generation metadata (prompts, checkpoint, LoRAs) from PNG images.");
    println!();
    println!("Usage:");
    println!("  prompt-lens <path-or-url> [<path-or-url>...]");
    println!("  prompt-lens scan <directory> [--jsonl <file>] [--csv <file>]");
    println!();
    println!("Single inputs print one pretty JSON record each. Scan mode walks a");
    println!("directory, extracts metadata from every .png in parallel and prints");
    println!("JSON Lines to stdout unless --jsonl or --csv redirects the output.");
    println!();
    println!("Environment:");
    println!("  PROMPT_LENS_SCAN_THREADS       worker threads for scan mode (1-32)");
    println!("  PROMPT_LENS_HTTP_TIMEOUT_SECS  HTTP fetch timeout (1-600, default 60)");
}

enum Command {
    Inspect(Vec<String>),
    Scan {
        directory: PathBuf,
        jsonl: Option<PathBuf>,
        csv: Option<PathBuf>,
    },
}

fn parse_args() -> Result<Command, String> {
    let mut args = std::env::args().skip(1);
    let Some(first) = args.next() else {
        return Err("No input given".to_string());
    };

    match first.as_str() {
        "--help" | "-h" => {
            usage();
            std::process::exit(0);
        }
        "scan" => {
            let mut directory = None;
            let mut jsonl = None;
            let mut csv = None;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--jsonl" => {
                        let Some(path) = args.next() else {
                            return Err("Missing path after --jsonl".to_string());
                        };
                        jsonl = Some(PathBuf::from(path));
                    }
                    "--csv" => {
                        let Some(path) = args.next() else {
                            return Err("Missing path after --csv".to_string());
                        };
                        csv = Some(PathBuf::from(path));
                    }
                    unknown if unknown.starts_with('-') => {
                        return Err(format!("Unknown argument: {}", unknown));
                    }
                    path => {
                        if directory.is_some() {
                            return Err("scan takes a single directory".to_string());
                        }
                        directory = Some(PathBuf::from(path));
                    }
                }
            }
            let Some(directory) = directory else {
                return Err("Missing directory for scan".to_string());
            };
            Ok(Command::Scan {
                directory,
                jsonl,
                csv,
            })
        }
        _ => {
            let mut inputs = vec![first];
            for arg in args {
                if arg.starts_with('-') {
                    return Err(format!("Unknown argument: {}", arg));
                }
                inputs.push(arg);
            }
            Ok(Command::Inspect(inputs))
        }
    }
}

fn main() {
    env_logger::init();

    let command = match parse_args() {
        Ok(command) => command,
        Err(error) => {
            eprintln!("{}", error);
            eprintln!();
            usage();
            std::process::exit(1);
        }
    };

    let outcome = match command {
        Command::Inspect(inputs) => run_inspect(&inputs),
        Command::Scan {
            directory,
            jsonl,
            csv,
        } => run_scan(&directory, jsonl.as_deref(), csv.as_deref()),
    };

    if let Err(error) = outcome {
        eprintln!("{}", error);
        std::process::exit(1);
    }
}

fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Pairs a single-thread runtime with the HTTP extractor so URL inputs can
/// be handled from this otherwise synchronous binary.
struct UrlFetcher {
    runtime: tokio::runtime::Runtime,
    extractor: MetadataExtractor<HttpByteSource>,
}

impl UrlFetcher {
    fn new() -> Result<Self, String> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| format!("Failed to start async runtime: {}", error))?;
        let extractor = MetadataExtractor::new().map_err(|error| error.to_string())?;
        Ok(UrlFetcher { runtime, extractor })
    }

    fn extract(&self, url: &str) -> Result<ExtractedMetadata, String> {
        self.runtime
            .block_on(self.extractor.extract(url))
            .map_err(|error| error.to_string())
    }
}

fn run_inspect(inputs: &[String]) -> Result<(), String> {
    let fetcher = if inputs.iter().any(|input| is_url(input)) {
        Some(UrlFetcher::new()?)
    } else {
        None
    };

    for input in inputs {
        let record = match (&fetcher, is_url(input)) {
            (Some(fetcher), true) => fetcher.extract(input)?,
            _ => extract_local_file(Path::new(input))?,
        };
        let rendered = serde_json::to_string_pretty(&record)
            .map_err(|error| format!("Failed to render record: {}", error))?;
        println!("{}", rendered);
    }
    Ok(())
}

fn extract_local_file(path: &Path) -> Result<ExtractedMetadata, String> {
    let src = path.to_string_lossy().to_string();
    if !is_png_source(&src) {
        return Ok(ExtractedMetadata::bare(&src));
    }
    let bytes = std::fs::read(path)
        .map_err(|error| format!("Failed to read {}: {}", path.display(), error))?;
    Ok(extract_from_bytes(&src, &bytes))
}

/// Worker count for scan mode. Defaults to the machine's parallelism
/// clamped to 2..=8; `PROMPT_LENS_SCAN_THREADS` overrides within 1..=32.
fn scan_threads() -> usize {
    if let Ok(raw) = std::env::var("PROMPT_LENS_SCAN_THREADS") {
        if let Ok(parsed) = raw.parse::<usize>() {
            return parsed.clamp(1, 32);
        }
        log::warn!("Ignoring invalid PROMPT_LENS_SCAN_THREADS value: {}", raw);
    }
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(4)
        .clamp(2, 8)
}

fn scan_pool() -> &'static rayon::ThreadPool {
    static POOL: OnceLock<rayon::ThreadPool> = OnceLock::new();
    POOL.get_or_init(|| {
        let threads = scan_threads();
        log::info!("Using {} scan worker threads", threads);
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("scan-{}", index))
            .build()
            .expect("failed to create scan threadpool")
    })
}

fn collect_png_files(directory: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(directory)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("png"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

fn scan_one(path: &Path) -> ExtractedMetadata {
    let src = path.to_string_lossy().to_string();
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) => {
            log::warn!("Failed to read {}: {}", path.display(), error);
            return ExtractedMetadata::bare(&src);
        }
    };
    let record = extract_from_bytes(&src, &bytes);
    if record.is_bare() {
        if let Some(text) = read_sidecar_txt(path) {
            log::debug!("Using sidecar parameters for {}", path.display());
            return extract_from_parameter_text(&src, &text);
        }
    }
    record
}

/// Some export pipelines strip PNG metadata but save the parameter block
/// as a sibling `.txt` file; fall back to it for images that yielded
/// nothing.
fn read_sidecar_txt(path: &Path) -> Option<String> {
    let txt_path = path.with_extension("txt");
    let content = std::fs::read_to_string(&txt_path).ok()?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn run_scan(directory: &Path, jsonl: Option<&Path>, csv: Option<&Path>) -> Result<(), String> {
    if !directory.is_dir() {
        return Err(format!("Not a directory: {}", directory.display()));
    }

    let started = Instant::now();
    let files = collect_png_files(directory);
    log::info!(
        "Scanning {} PNG files under {}",
        files.len(),
        directory.display()
    );

    let records: Vec<ExtractedMetadata> =
        scan_pool().install(|| files.par_iter().map(|path| scan_one(path)).collect());

    let with_prompt = records.iter().filter(|record| record.prompt.is_some()).count();
    let with_checkpoint = records
        .iter()
        .filter(|record| record.checkpoint.is_some())
        .count();
    let elapsed = started.elapsed();
    let throughput = if elapsed.as_secs_f64() > 0.0 {
        records.len() as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    log::info!(
        "Scan complete: {} files, {} with prompts, {} with checkpoints in {:.0} ms ({:.1} files/s)",
        records.len(),
        with_prompt,
        with_checkpoint,
        elapsed.as_secs_f64() * 1000.0,
        throughput
    );

    if let Some(path) = jsonl {
        write_jsonl(path, &records)?;
    }
    if let Some(path) = csv {
        write_csv(path, &records)?;
    }
    if jsonl.is_none() && csv.is_none() {
        for record in &records {
            let line = serde_json::to_string(record)
                .map_err(|error| format!("Failed to render record: {}", error))?;
            println!("{}", line);
        }
    }
    Ok(())
}

fn write_jsonl(path: &Path, records: &[ExtractedMetadata]) -> Result<(), String> {
    let mut output = String::new();
    for record in records {
        let line = serde_json::to_string(record)
            .map_err(|error| format!("Failed to render record: {}", error))?;
        output.push_str(&line);
        output.push('\n');
    }
    std::fs::write(path, output)
        .map_err(|error| format!("Failed to write {}: {}", path.display(), error))?;
    log::info!("Wrote {} records to {}", records.len(), path.display());
    Ok(())
}

fn write_csv(path: &Path, records: &[ExtractedMetadata]) -> Result<(), String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(["src", "prompt", "parameters", "checkpoint", "loras"])
        .map_err(|error| format!("Failed to write CSV header: {}", error))?;

    for record in records {
        let loras = record.loras.join("|");
        writer
            .write_record([
                record.src.as_str(),
                record.prompt.as_deref().unwrap_or(""),
                record.parameters.as_deref().unwrap_or(""),
                record.checkpoint.as_deref().unwrap_or(""),
                loras.as_str(),
            ])
            .map_err(|error| format!("Failed to write CSV row: {}", error))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|error| format!("Failed to finish CSV export: {}", error.into_error()))?;
    std::fs::write(path, bytes)
        .map_err(|error| format!("Failed to write {}: {}", path.display(), error))?;
    log::info!("Wrote {} records to {}", records.len(), path.display());
    Ok(())
}
