use anyhow::Result;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

const LOG_FILE_PREFIX: &str = "server_fanout_";

pub fn setup_logging(log_dir: &Path, log_level: &str) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    // Clean up old log files, keeping only the most recent one
    cleanup_old_logs(log_dir)?;

    let log_file_name = format!("{}{}.log", LOG_FILE_PREFIX, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = log_dir.join(log_file_name);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S%.3f]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(parse_level(log_level))
        // Redis and hyper internals are noisy at debug.
        .level_for("redis", log::LevelFilter::Warn)
        .level_for("hyper", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .chain(fern::log_file(log_path)?)
        .apply()?;

    Ok(())
}

fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

fn cleanup_old_logs(log_dir: &Path) -> Result<()> {
    let mut entries: Vec<(SystemTime, std::path::PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX))
        })
        .map(|p| {
            let modified = fs::metadata(&p)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, p)
        })
        .collect();

    // Sort by modification time, newest first
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    // Keep the most recent one (index 0), delete the rest
    for (_, path) in entries.iter().skip(1) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to delete old log file {:?}: {}", path, e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn touch(dir: &Path, name: &str, age_secs: u64) {
        let path = dir.join(name);
        fs::write(&path, b"line\n").unwrap();
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs)).unwrap();
    }

    #[test]
    fn cleanup_keeps_only_the_newest_server_log() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "server_fanout_old.log", 300);
        touch(dir.path(), "server_fanout_older.log", 600);
        touch(dir.path(), "server_fanout_new.log", 10);
        touch(dir.path(), "other_service.log", 900);
        touch(dir.path(), "notes.txt", 900);

        cleanup_old_logs(dir.path()).unwrap();

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["notes.txt", "other_service.log", "server_fanout_new.log"]);
    }

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(parse_level("DEBUG"), log::LevelFilter::Debug);
        assert_eq!(parse_level("trace"), log::LevelFilter::Trace);
        assert_eq!(parse_level("fatal"), log::LevelFilter::Info);
    }
}
