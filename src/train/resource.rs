/// Resident and peak resident memory of this process, in MB.
///
/// Reads `/proc/self/status`; returns `None` where that file does not exist.
pub fn cpu_memory_mb() -> Option<(f64, f64)> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_status(&status)
}

fn parse_status(status: &str) -> Option<(f64, f64)> {
    let mut rss = None;
    let mut hwm = None;
    for line in status.lines() {
        if let Some(v) = line.strip_prefix("VmRSS:") {
            rss = v.split_whitespace().next().and_then(|s| s.parse::<f64>().ok());
        } else if let Some(v) = line.strip_prefix("VmHWM:") {
            hwm = v.split_whitespace().next().and_then(|s| s.parse::<f64>().ok());
        }
    }
    let rss = rss? / 1024.0;
    Some((rss, hwm.map_or(rss, |h| h / 1024.0)))
}
