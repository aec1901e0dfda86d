use std::path::{Path, PathBuf};

/// Parse a comma-separated list of indices (`"0,2,4"`).
///
/// Entries that fail to parse are skipped rather than failing the whole
/// list, matching how operator input is treated elsewhere.
///
/// # Examples
///
/// ```
/// use myqueue::utils::parse_int_list;
///
/// assert_eq!(parse_int_list("0,2,4"), vec![0, 2, 4]);
/// assert_eq!(parse_int_list("1, 3 ,x,5"), vec![1, 3, 5]);
/// assert_eq!(parse_int_list(""), Vec::<u32>::new());
/// ```
pub fn parse_int_list(input: &str) -> Vec<u32> {
    input
        .split(',')
        .filter_map(|part| part.trim().parse::<u32>().ok())
        .collect()
}

/// Parse a task-id selector: either a single id (`"5"`) or an inclusive
/// range (`"1-10"`).
///
/// A reversed range (`"10-1"`) and unparseable input both yield an empty
/// vector; callers treat that as "nothing selected".
///
/// # Examples
///
/// ```
/// use myqueue::utils::parse_id_range;
///
/// assert_eq!(parse_id_range("5"), vec![5]);
/// assert_eq!(parse_id_range("2-4"), vec![2, 3, 4]);
/// assert!(parse_id_range("4-2").is_empty());
/// assert!(parse_id_range("abc").is_empty());
/// ```
pub fn parse_id_range(input: &str) -> Vec<u64> {
    let input = input.trim();

    if let Some((start, end)) = input.split_once('-') {
        if start.is_empty() || end.is_empty() {
            return Vec::new();
        }
        match (start.parse::<u64>(), end.parse::<u64>()) {
            (Ok(a), Ok(b)) if a <= b => (a..=b).collect(),
            _ => Vec::new(),
        }
    } else {
        input.parse::<u64>().map(|id| vec![id]).unwrap_or_default()
    }
}

/// Format a duration in seconds for display (e.g. `"2h 30m 45s"`).
pub fn format_duration_secs(total_secs: i64) -> String {
    let total_secs = total_secs.max(0);
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Expand a user-supplied path to an absolute one.
///
/// `~` expands against `$HOME`; relative paths resolve against the current
/// working directory.
pub fn absolute_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(p))
            .unwrap_or_else(|_| p.to_path_buf())
    }
}

/// Parse a workdir-list file for batch submission.
///
/// One directory per line; blank lines and lines whose first non-whitespace
/// character is `#` are skipped. Returns `(existing_dirs, missing_entries)`.
pub fn parse_workdirs_file(path: &Path) -> std::io::Result<(Vec<String>, Vec<String>)> {
    let content = std::fs::read_to_string(path)?;
    let mut valid = Vec::new();
    let mut invalid = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if Path::new(line).is_dir() {
            valid.push(line.to_string());
        } else {
            invalid.push(line.to_string());
        }
    }

    Ok((valid, invalid))
}

/// Join resource ids into the comma-separated form used in child
/// environment variables. Empty slice yields an empty string.
pub fn join_ids(ids: &[u32]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_int_list() {
        assert_eq!(parse_int_list("0,1,2"), vec![0, 1, 2]);
        assert_eq!(parse_int_list(" 7 , 9 "), vec![7, 9]);
        assert_eq!(parse_int_list("a,b"), Vec::<u32>::new());
        assert_eq!(parse_int_list(""), Vec::<u32>::new());
    }

    #[test]
    fn test_parse_id_range_single() {
        assert_eq!(parse_id_range("1"), vec![1]);
        assert_eq!(parse_id_range(" 42 "), vec![42]);
    }

    #[test]
    fn test_parse_id_range_inclusive() {
        assert_eq!(parse_id_range("1-3"), vec![1, 2, 3]);
        assert_eq!(parse_id_range("7-7"), vec![7]);
    }

    #[test]
    fn test_parse_id_range_degenerate() {
        assert!(parse_id_range("9-3").is_empty());
        assert!(parse_id_range("-3").is_empty());
        assert!(parse_id_range("3-").is_empty());
        assert!(parse_id_range("x-y").is_empty());
        assert!(parse_id_range("").is_empty());
    }

    #[test]
    fn test_format_duration_secs() {
        assert_eq!(format_duration_secs(45), "45s");
        assert_eq!(format_duration_secs(1845), "30m 45s");
        assert_eq!(format_duration_secs(9045), "2h 30m 45s");
        assert_eq!(format_duration_secs(-5), "0s");
    }

    #[test]
    fn test_join_ids() {
        assert_eq!(join_ids(&[0, 1, 5]), "0,1,5");
        assert_eq!(join_ids(&[]), "");
    }

    #[test]
    fn test_parse_workdirs_file() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("a");
        std::fs::create_dir(&sub).unwrap();

        let list = dir.path().join("dirs.txt");
        let mut f = std::fs::File::create(&list).unwrap();
        writeln!(f, "# comment").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "  {}  ", sub.display()).unwrap();
        writeln!(f, "/does/not/exist").unwrap();

        let (valid, invalid) = parse_workdirs_file(&list).unwrap();
        assert_eq!(valid, vec![sub.display().to_string()]);
        assert_eq!(invalid, vec!["/does/not/exist".to_string()]);
    }
}
