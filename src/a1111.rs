//! Flat parameter-text splitting for A1111-style metadata.
//!
//! A1111 and compatible tools write one combined block: positive prompt,
//! a `Negative prompt:` line, then a settings line (`Steps: 20, ...`).
//! This module splits that block into its prompt halves and drops the
//! settings tail.

/// Marker separating positive and negative prompt text, matched
/// case-insensitively.
const NEGATIVE_MARKER: &str = "negative prompt:";

/// Optional label some exporters prefix to the positive text.
const PROMPT_LABEL: &str = "prompt:";

/// Keywords that open a sampler-settings line.
const SETTING_KEYWORDS: &[&str] = &[
    "steps",
    "sampler",
    "cfg scale",
    "seed",
    "size",
    "model",
    "vae",
    "clip skip",
    "denoising strength",
];

/// A flat parameter block split into prompt halves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSplit {
    pub positive: String,
    pub negative: Option<String>,
}

/// Splits combined prompt text at the negative-prompt marker.
///
/// Text without the marker passes through unchanged as the positive half,
/// apart from a stray leading `Prompt:` label. The negative half is cut
/// at the first settings line and loses leading separator characters left
/// over from the marker.
pub fn split_parameter_text(raw: &str) -> ParameterSplit {
    let trimmed = raw.trim();
    let lowered = trimmed.to_ascii_lowercase();

    let Some(marker_pos) = lowered.find(NEGATIVE_MARKER) else {
        return ParameterSplit {
            positive: strip_prompt_label(trimmed).to_string(),
            negative: None,
        };
    };

    let positive = strip_prompt_label(trimmed[..marker_pos].trim())
        .trim()
        .to_string();

    let after_marker = &trimmed[marker_pos + NEGATIVE_MARKER.len()..];
    let negative = truncate_at_settings(strip_leading_separators(after_marker));

    ParameterSplit {
        positive,
        negative: if negative.is_empty() {
            None
        } else {
            Some(negative)
        },
    }
}

fn strip_prompt_label(text: &str) -> &str {
    match text.get(..PROMPT_LABEL.len()) {
        Some(head) if head.eq_ignore_ascii_case(PROMPT_LABEL) => {
            text[PROMPT_LABEL.len()..].trim_start()
        }
        _ => text,
    }
}

fn strip_leading_separators(text: &str) -> &str {
    text.trim_start_matches(|c: char| c == ':' || c == '-' || c.is_whitespace())
}

/// Keeps lines up to the first settings line, trimmed.
fn truncate_at_settings(text: &str) -> String {
    let mut kept = Vec::new();
    for line in text.lines() {
        if is_settings_line(line) {
            break;
        }
        kept.push(line);
    }
    kept.join("\n").trim().to_string()
}

/// A settings line opens with a known keyword followed by a colon, e.g.
/// `Steps: 20, Sampler: Euler a, CFG scale: 7`.
fn is_settings_line(line: &str) -> bool {
    let lowered = line.trim_start().to_ascii_lowercase();
    SETTING_KEYWORDS.iter().any(|keyword| {
        lowered
            .strip_prefix(keyword)
            .is_some_and(|rest| rest.trim_start().starts_with(':'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_standard_block() {
        let split = split_parameter_text("A, B\nNegative prompt: C, D\nSteps: 20, Sampler: Euler");
        assert_eq!(split.positive, "A, B");
        assert_eq!(split.negative.as_deref(), Some("C, D"));
    }

    #[test]
    fn test_text_without_marker_passes_through() {
        let split = split_parameter_text("a watercolor fox in the snow");
        assert_eq!(split.positive, "a watercolor fox in the snow");
        assert_eq!(split.negative, None);
    }

    #[test]
    fn test_leading_prompt_label_is_stripped() {
        let split = split_parameter_text("Prompt: sunrise over dunes");
        assert_eq!(split.positive, "sunrise over dunes");

        let split = split_parameter_text("prompt: sunrise\nNegative prompt: haze");
        assert_eq!(split.positive, "sunrise");
        assert_eq!(split.negative.as_deref(), Some("haze"));
    }

    #[test]
    fn test_marker_match_is_case_insensitive() {
        let split = split_parameter_text("lilies\nNEGATIVE PROMPT: wilted");
        assert_eq!(split.positive, "lilies");
        assert_eq!(split.negative.as_deref(), Some("wilted"));
    }

    #[test]
    fn test_leading_separators_after_marker_are_dropped() {
        let split = split_parameter_text("city street\nNegative prompt: - blurry, low quality");
        assert_eq!(split.negative.as_deref(), Some("blurry, low quality"));
    }

    #[test]
    fn test_settings_only_negative_becomes_none() {
        let split = split_parameter_text("portrait\nNegative prompt:\nSteps: 30, Seed: 12345");
        assert_eq!(split.positive, "portrait");
        assert_eq!(split.negative, None);
    }

    #[test]
    fn test_multiline_negative_kept_until_settings_line() {
        let split =
            split_parameter_text("docks\nNegative prompt: fog\noversaturated\nCFG scale: 7.5");
        assert_eq!(split.negative.as_deref(), Some("fog\noversaturated"));
    }

    #[test]
    fn test_every_settings_keyword_terminates() {
        for line in [
            "Steps: 20",
            "Sampler: DPM++ 2M",
            "CFG scale: 7",
            "Seed: 1",
            "Size: 512x768",
            "Model: sd15",
            "VAE: vae-ft-mse",
            "Clip skip: 2",
            "Denoising strength: 0.4",
        ] {
            let block = format!("ok\nNegative prompt: bad\n{}", line);
            let split = split_parameter_text(&block);
            assert_eq!(split.negative.as_deref(), Some("bad"), "line: {}", line);
        }
    }

    #[test]
    fn test_non_settings_colon_lines_survive() {
        let split = split_parameter_text("ok\nNegative prompt: looks like: this\nmodeled poses");
        assert_eq!(split.negative.as_deref(), Some("looks like: this\nmodeled poses"));
    }

    #[test]
    fn test_empty_input_yields_empty_split() {
        let split = split_parameter_text("   ");
        assert_eq!(split.positive, "");
        assert_eq!(split.negative, None);
    }

    #[test]
    fn test_marker_with_no_positive_half() {
        let split = split_parameter_text("Negative prompt: watermark, username");
        assert_eq!(split.positive, "");
        assert_eq!(split.negative.as_deref(), Some("watermark, username"));
    }
}
