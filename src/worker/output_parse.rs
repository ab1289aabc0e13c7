use super::WorkerResult;

pub const OUTPUT_START_MARKER: &str = "---NANOCLAW_OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---NANOCLAW_OUTPUT_END---";

/// Extracts the structured result from worker stdout.
///
/// The JSON between the start and end markers wins. Without a complete
/// marker pair the last non-empty line is tried instead.
pub fn parse_worker_output(stdout: &str) -> Result<WorkerResult, String> {
    let payload = match delimited_payload(stdout) {
        Some(payload) => payload,
        None => stdout
            .lines()
            .map(str::trim)
            .rev()
            .find(|line| !line.is_empty())
            .ok_or_else(|| "worker produced no output".to_string())?,
    };

    serde_json::from_str(payload).map_err(|err| {
        format!(
            "invalid result json ({err}) in `{}`",
            excerpt(payload, 200)
        )
    })
}

fn delimited_payload(stdout: &str) -> Option<&str> {
    let start = stdout.find(OUTPUT_START_MARKER)? + OUTPUT_START_MARKER.len();
    let end = stdout[start..].find(OUTPUT_END_MARKER)? + start;
    Some(stdout[start..end].trim())
}

fn excerpt(raw: &str, max_chars: usize) -> String {
    let count = raw.chars().count();
    if count <= max_chars {
        return raw.to_string();
    }
    let tail: String = raw.chars().skip(count - max_chars).collect();
    format!("...{tail}")
}
