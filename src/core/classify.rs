use std::path::Path;

use crate::core::domain::Classification;

/// Substrings the generator prints when it rejects a player configuration.
///
/// These come from the generator's own error messages and are tied to its
/// version: an upgrade can rename or drop any of them, in which case rejected
/// configurations degrade to `GeneratorCrash`. Override them with
/// `GAMEGEN_VALIDATION_MARKERS` rather than editing this list in place.
pub const DEFAULT_VALIDATION_MARKERS: &[&str] = &[
    "Please fix your yaml",
    "No player files found",
    "No world found to handle game",
    "Error generating option",
    "is not a valid option",
    "yaml.scanner.ScannerError",
    "yaml.parser.ParserError",
];

pub fn default_markers() -> Vec<String> {
    DEFAULT_VALIDATION_MARKERS
        .iter()
        .map(|m| m.to_string())
        .collect()
}

/// Classifies a process that exited on its own. Timeouts and cancellations
/// never reach this function. A process killed by a signal (`exit_code` is
/// `None`) is a crash whatever it printed.
pub fn classify(
    exit_code: Option<i32>,
    stdout: &str,
    stderr: &str,
    artifact: Option<&Path>,
    markers: &[String],
) -> Classification {
    match (exit_code, artifact) {
        (Some(0), Some(_)) => Classification::Success,
        (Some(0), None) => Classification::GeneratorCrash,
        (Some(_), _)
            if find_marker(stderr, markers).is_some() || find_marker(stdout, markers).is_some() =>
        {
            Classification::UserInputError
        }
        _ => Classification::GeneratorCrash,
    }
}

pub fn find_marker<'a>(output: &str, markers: &'a [String]) -> Option<&'a str> {
    markers
        .iter()
        .find(|m| !m.is_empty() && output.contains(m.as_str()))
        .map(String::as_str)
}

/// The text shown to the submitter for a rejected configuration: whichever
/// stream carries the marker, unmodified.
pub fn user_facing_output<'a>(stdout: &'a str, stderr: &'a str, markers: &[String]) -> &'a str {
    if find_marker(stderr, markers).is_some() || stdout.is_empty() {
        stderr
    } else {
        stdout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Vec<String> {
        default_markers()
    }

    #[test]
    fn test_success_requires_artifact() {
        let artifact = Path::new("AP_1.zip");
        assert_eq!(
            classify(Some(0), "", "", Some(artifact), &markers()),
            Classification::Success
        );
        assert_eq!(
            classify(Some(0), "done", "", None, &markers()),
            Classification::GeneratorCrash
        );
    }

    #[test]
    fn test_marker_means_user_input_error() {
        let stderr = "ValueError: File Alice.yaml is invalid. Please fix your yaml.\n";
        assert_eq!(
            classify(Some(1), "", stderr, None, &markers()),
            Classification::UserInputError
        );
        assert_eq!(
            classify(Some(1), stderr, "", None, &markers()),
            Classification::UserInputError
        );
    }

    #[test]
    fn test_unrecognized_failure_is_crash() {
        assert_eq!(
            classify(Some(2), "", "Segmentation fault", None, &markers()),
            Classification::GeneratorCrash
        );
        assert_eq!(
            classify(None, "", "", None, &markers()),
            Classification::GeneratorCrash
        );
    }

    #[test]
    fn test_killed_by_signal_is_crash_even_with_marker() {
        assert_eq!(
            classify(None, "", "Please fix your yaml", None, &markers()),
            Classification::GeneratorCrash
        );
    }

    #[test]
    fn test_empty_marker_never_matches() {
        let markers = vec![String::new()];
        assert_eq!(
            classify(Some(1), "anything", "", None, &markers),
            Classification::GeneratorCrash
        );
    }

    #[test]
    fn test_user_facing_output_prefers_marked_stream() {
        let markers = markers();
        assert_eq!(
            user_facing_output("progress", "Please fix your yaml", &markers),
            "Please fix your yaml"
        );
        assert_eq!(
            user_facing_output("No player files found", "warning", &markers),
            "No player files found"
        );
    }
}
