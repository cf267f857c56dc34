//! CLI command implementations

use crate::loopback::LoopbackPartner;
use crate::output::{format_bytes, format_limit, format_speed, print_output};
use crate::progress::TransferProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, bail, Context, Result};
use console::style;
use pfxfer_core::util::system_time_to_utc;
use pfxfer_core::TransferCore;
use pfxfer_types::{FileInfo, FolderInfo, TransferEvent, TransferSettings};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;

// ============================================================================
// Copy Command
// ============================================================================

#[derive(Debug, Serialize)]
struct CopySummary {
    source: PathBuf,
    destination: PathBuf,
    size: u64,
    resumed_from: u64,
    transferred: u64,
    elapsed_secs: f64,
    average_rate: u64,
}

impl fmt::Display for CopySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} Copied {} to {}",
            style("✓").green().bold(),
            style(self.source.display()).cyan(),
            style(self.destination.display()).cyan()
        )?;
        writeln!(f, "  Size: {}", format_bytes(self.size))?;
        if self.resumed_from > 0 {
            writeln!(f, "  Resumed at: {}", format_bytes(self.resumed_from))?;
        }
        write!(
            f,
            "  Transferred: {} in {:.1}s ({})",
            format_bytes(self.transferred),
            self.elapsed_secs,
            format_speed(self.average_rate)
        )
    }
}

enum Outcome {
    Completed,
    Aborted(String),
    Interrupted,
}

pub async fn copy_file(
    core: &TransferCore,
    source: PathBuf,
    destination: PathBuf,
    limit: Option<u64>,
    chunk_size: usize,
    format: OutputFormat,
) -> Result<()> {
    let metadata = tokio::fs::metadata(&source)
        .await
        .with_context(|| format!("Cannot read {}", source.display()))?;
    if !metadata.is_file() {
        bail!("{} is not a file", source.display());
    }

    let destination = if destination.is_dir() {
        let name = source
            .file_name()
            .ok_or_else(|| anyhow!("{} has no file name", source.display()))?;
        destination.join(name)
    } else {
        destination
    };
    let name = destination
        .file_name()
        .ok_or_else(|| anyhow!("{} has no file name", destination.display()))?
        .to_string_lossy()
        .into_owned();
    let target_dir = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    // The target directory acts as a folder shared with the loopback partner
    let folder = FolderInfo::new("copy");
    core.folders.add_folder(folder.clone(), target_dir);
    let file = FileInfo::new(
        folder,
        name,
        metadata.len(),
        system_time_to_utc(metadata.modified()?),
    );

    if let Some(limit) = limit {
        let mut settings = core.settings();
        settings.bandwidth.upload_limit_lan = limit;
        settings.bandwidth.download_limit_lan = limit;
        core.manager.set_settings(settings);
    }
    core.manager.start();

    let mut events = core.manager.subscribe();
    let partner = Arc::new(LoopbackPartner::new(
        source.clone(),
        chunk_size,
        &core.manager,
    ));
    let download = core
        .manager
        .download_file(file.clone(), false, Some(partner.clone()))?;

    let progress = match format {
        OutputFormat::Json => TransferProgress::hidden(),
        OutputFormat::Human | OutputFormat::Table => TransferProgress::new(&download),
    };
    let started = Instant::now();

    let outcome = if download.is_completed() {
        Outcome::Completed
    } else {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        let mut broken_reason = None;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break Outcome::Interrupted,
                event = events.recv() => match event {
                    Ok(TransferEvent::DownloadCompleted { file: done }) if done == file => {
                        break Outcome::Completed;
                    }
                    Ok(TransferEvent::DownloadBroken { file: broken, reason }) if broken == file => {
                        broken_reason = Some(reason);
                    }
                    Ok(TransferEvent::DownloadAborted { file: aborted }) if aborted == file => {
                        break Outcome::Aborted(
                            broken_reason.take().unwrap_or_else(|| "download aborted".to_string()),
                        );
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => {
                        break Outcome::Aborted("transfer manager stopped".to_string());
                    }
                },
                _ = ticker.tick() => progress.update(download.counter()),
            }
        }
    };
    partner.stop();
    core.manager.shutdown();

    match outcome {
        Outcome::Completed => {
            progress.finish_completed(download.counter());

            let counter = download.counter();
            let elapsed = started.elapsed().as_secs_f64();
            let summary = CopySummary {
                source,
                destination,
                size: counter.size(),
                resumed_from: counter.start_offset(),
                transferred: counter.bytes_transferred(),
                elapsed_secs: elapsed,
                average_rate: counter.calculate_rate() as u64,
            };
            print_output(&summary, format)?;
        }
        Outcome::Aborted(reason) => {
            progress.abandon(&reason);
            bail!("Copy of {} failed: {}", source.display(), reason);
        }
        Outcome::Interrupted => {
            progress.interrupted();
            println!(
                "{} Staging file kept, run the same command again to resume",
                style("⏸").yellow()
            );
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    core: &TransferCore,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => show_config(&core.settings(), format)?,

        Some(ConfigAction::Get { key }) => {
            let settings = serde_json::to_value(core.settings())?;
            let value =
                lookup(&settings, &key).ok_or_else(|| anyhow!("Unknown config key: {}", key))?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
                OutputFormat::Human | OutputFormat::Table => println!("{}", display_value(value)),
            }
        }

        Some(ConfigAction::Set { key, value }) => {
            let settings = with_key_set(&core.settings(), &key, &value)?;
            core.update_settings(settings).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset { yes }) => {
            use dialoguer::Confirm;

            let confirmed = yes
                || Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?;

            if confirmed {
                let defaults = core.storage.reset_settings().await?;
                core.manager.set_settings(defaults);
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}

fn show_config(settings: &TransferSettings, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(settings)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct ConfigRow {
                key: String,
                value: String,
            }

            let mut entries = Vec::new();
            flatten("", &serde_json::to_value(settings)?, &mut entries);
            let rows: Vec<ConfigRow> = entries
                .into_iter()
                .map(|(key, value)| ConfigRow { key, value })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            let bandwidth = &settings.bandwidth;
            println!("pfxfer Configuration:");
            println!();
            println!("  Upload limit (WAN):    {}", format_limit(bandwidth.upload_limit_wan));
            println!("  Upload limit (LAN):    {}", format_limit(bandwidth.upload_limit_lan));
            println!("  Download limit (WAN):  {}", format_limit(bandwidth.download_limit_wan));
            println!("  Download limit (LAN):  {}", format_limit(bandwidth.download_limit_lan));
            println!("  Accounting window:     {} ms", bandwidth.provider_interval_ms);
            println!(
                "  Request timeout:       {} s",
                settings.download_request_timeout_secs
            );
            println!(
                "  Health check interval: {} s",
                settings.transfer_check_interval_secs
            );
        }
    }
    Ok(())
}

/// Resolve a dotted key like `bandwidth.upload_limit_wan`
fn lookup<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.').try_fold(value, |value, part| value.get(part))
}

/// Copy of `settings` with one dotted key replaced. The raw value is parsed
/// as JSON first and taken as a plain string otherwise.
fn with_key_set(settings: &TransferSettings, key: &str, raw: &str) -> Result<TransferSettings> {
    let mut root = serde_json::to_value(settings)?;

    let mut slot = &mut root;
    for part in key.split('.') {
        slot = slot
            .get_mut(part)
            .ok_or_else(|| anyhow!("Unknown config key: {}", key))?;
    }
    if slot.is_object() {
        bail!("{} is a section, set one of its keys", key);
    }
    *slot = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));

    serde_json::from_value(root).with_context(|| format!("Invalid value for {}: {}", key, raw))
}

fn flatten(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&path, child, out);
            }
        }
        other => out.push((prefix.to_string(), display_value(other))),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_nested_key() {
        let settings = TransferSettings::default();
        let updated = with_key_set(&settings, "bandwidth.upload_limit_wan", "4096").unwrap();
        assert_eq!(updated.bandwidth.upload_limit_wan, 4096);
        assert_eq!(updated.download_request_timeout_secs, 180);
    }

    #[test]
    fn test_set_rejects_unknown_keys_and_bad_values() {
        let settings = TransferSettings::default();
        assert!(with_key_set(&settings, "bandwidth.nope", "1").is_err());
        assert!(with_key_set(&settings, "bandwidth", "1").is_err());
        assert!(with_key_set(&settings, "bandwidth.upload_limit_wan", "fast").is_err());
    }

    #[test]
    fn test_lookup_and_flatten() {
        let value = serde_json::to_value(TransferSettings::default()).unwrap();
        assert_eq!(
            lookup(&value, "bandwidth.provider_interval_ms"),
            Some(&Value::from(1000u64))
        );
        assert!(lookup(&value, "missing").is_none());

        let mut entries = Vec::new();
        flatten("", &value, &mut entries);
        assert!(entries.contains(&(
            "transfer_check_interval_secs".to_string(),
            "10".to_string()
        )));
        assert!(entries
            .iter()
            .any(|(key, _)| key == "bandwidth.download_limit_lan"));
    }
}
