use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde_json::Value;

use crate::data::Fields;

/// Cumulative metrics of a run, as written to `metrics_epoch_<N>.json`.
pub type MetricsRecord = BTreeMap<String, Value>;

/// Writes `metrics` as pretty-printed JSON and logs it when asked.
pub fn dump_metrics(path: &Path, metrics: &MetricsRecord, log: bool) -> io::Result<()> {
    let json = serde_json::to_string_pretty(metrics)?;
    fs::write(path, &json)?;
    if log {
        tracing::info!("metrics: {json}");
    }
    Ok(())
}

fn write_lines<I, S>(path: &Path, lines: I) -> io::Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = BufWriter::new(fs::File::create(path)?);
    for line in lines {
        writeln!(out, "{}", line.as_ref())?;
    }
    out.flush()
}

/// Writes `vocab.txt`, `target.txt`, `vocab_freq.txt` and, when given,
/// `conf.json` with the model configuration.
pub fn dump_info(serialization_dir: &Path, fields: &Fields, model_conf: Option<&Value>) -> io::Result<()> {
    fs::create_dir_all(serialization_dir)?;
    write_lines(&serialization_dir.join("vocab.txt"), &fields.text.itos)?;
    write_lines(&serialization_dir.join("target.txt"), &fields.label.itos)?;

    let mut freqs: Vec<(&String, &usize)> = fields.text.freqs.iter().collect();
    freqs.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    write_lines(
        &serialization_dir.join("vocab_freq.txt"),
        freqs.into_iter().map(|(token, count)| format!("{token}\t{count}")),
    )?;

    if let Some(conf) = model_conf {
        fs::write(serialization_dir.join("conf.json"), serde_json::to_string_pretty(conf)?)?;
    }
    Ok(())
}

/// `HH:MM:SS` for a duration in seconds.
pub fn format_duration(seconds: u64) -> String {
    format!("{:02}:{:02}:{:02}", seconds / 3600, (seconds / 60) % 60, seconds % 60)
}
