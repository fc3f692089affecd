use std::{
    cell::RefCell,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use rayon::prelude::*;
use serde::Deserialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::Provider;
use crate::{
    error::ProviderError,
    model::{CostRecord, DateRange, UsageRecord},
};

const PROVIDER: &str = "file";

#[derive(Debug, Clone, Default)]
pub struct FileSettings {
    pub data_dirs: Vec<PathBuf>,
}

/// One line of a saved export.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum SavedRecord {
    Usage(UsageRecord),
    Cost(CostRecord),
}

#[derive(Debug, Default)]
struct Loaded {
    usage: Vec<UsageRecord>,
    costs: Vec<CostRecord>,
}

/// Replays records previously exported to `*.jsonl` files.
///
/// The files are read once per provider; each query filters the cached records.
pub struct FileProvider {
    data_dirs: Vec<PathBuf>,
    loaded: RefCell<Option<Loaded>>,
}

impl FileProvider {
    pub fn new(settings: &FileSettings) -> Result<Self, ProviderError> {
        if settings.data_dirs.is_empty() {
            return Err(ProviderError::configuration(
                PROVIDER,
                "no data directories given (use --data-dir or file.data_dirs)",
            ));
        }
        Ok(FileProvider {
            data_dirs: settings.data_dirs.clone(),
            loaded: RefCell::new(None),
        })
    }

    fn read_all(&self) -> Result<Loaded, ProviderError> {
        let files = collect_jsonl_files(&self.data_dirs);
        debug!(files = files.len(), "loading saved records");

        let per_file: Vec<Loaded> = files
            .par_iter()
            .map(|path| load_file(path))
            .collect::<Result<_, _>>()?;

        let mut loaded = Loaded::default();
        for file in per_file {
            loaded.usage.extend(file.usage);
            loaded.costs.extend(file.costs);
        }
        Ok(loaded)
    }

    fn with_records<T: Default>(&self, pick: impl FnOnce(&Loaded) -> T) -> Result<T, ProviderError> {
        let mut cache = self.loaded.borrow_mut();
        if cache.is_none() {
            *cache = Some(self.read_all()?);
        }
        Ok(cache.as_ref().map(pick).unwrap_or_default())
    }
}

impl Provider for FileProvider {
    fn name(&self) -> &'static str {
        "Local export"
    }

    fn usage_data(&self, range: &DateRange) -> Result<Vec<UsageRecord>, ProviderError> {
        self.with_records(|loaded| {
            loaded
                .usage
                .iter()
                .filter(|u| range.contains(u.timestamp.date_naive()))
                .cloned()
                .collect()
        })
    }

    fn cost_data(&self, range: &DateRange) -> Result<Vec<CostRecord>, ProviderError> {
        self.with_records(|loaded| {
            loaded
                .costs
                .iter()
                .filter(|c| range.contains(c.billing_day()))
                .cloned()
                .collect()
        })
    }
}

fn collect_jsonl_files(data_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for dir in data_dirs {
        if !dir.exists() {
            warn!(dir = %dir.display(), "data directory does not exist");
            continue;
        }
        for entry in WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.into_path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

fn load_file(path: &Path) -> Result<Loaded, ProviderError> {
    let fh = File::open(path)
        .map_err(|e| ProviderError::query(PROVIDER, format!("opening {}", path.display()), e))?;

    let mut loaded = Loaded::default();
    for (idx, line) in BufReader::new(fh).lines().enumerate() {
        let line = line.map_err(|e| {
            ProviderError::query(PROVIDER, format!("reading {}", path.display()), e)
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record: SavedRecord = serde_json::from_str(&line).map_err(|e| {
            ProviderError::decode(PROVIDER, format!("{}:{}", path.display(), idx + 1), e)
        })?;
        match record {
            SavedRecord::Usage(u) => loaded.usage.push(u),
            SavedRecord::Cost(c) => loaded.costs.push(c),
        }
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::model::fixtures::{day, january};

    const USAGE_LINE: &str = r#"{"kind":"usage","service":"CloudWatch","metric":"IncomingBytes","value":1.25,"unit":"GB","timestamp":"2024-01-05T00:00:00Z"}"#;
    const COST_LINE: &str = r#"{"kind":"cost","service":"AmazonCloudWatch","itemName":"Account: 111","cost":10.0,"currency":"USD","period":"Daily","startTime":"2024-01-01T00:00:00Z","endTime":"2024-01-02T00:00:00Z","accountId":"111"}"#;
    const LATE_COST_LINE: &str = r#"{"kind":"cost","service":"AmazonCloudWatch","itemName":"Account: 111","cost":99.0,"currency":"USD","period":"Daily","startTime":"2024-03-01T00:00:00Z","endTime":"2024-03-02T00:00:00Z","accountId":"111"}"#;

    fn provider_for(dir: &Path) -> FileProvider {
        FileProvider::new(&FileSettings {
            data_dirs: vec![dir.to_path_buf()],
        })
        .unwrap()
    }

    #[test]
    fn reads_nested_files_and_filters_by_range() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("2024/01")).unwrap();
        fs::write(
            dir.path().join("2024/01/export.jsonl"),
            format!("{USAGE_LINE}\n\n{COST_LINE}\n{LATE_COST_LINE}\n"),
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let provider = provider_for(dir.path());
        let usage = provider.usage_data(&january()).unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].metric, "IncomingBytes");

        let costs = provider.cost_data(&january()).unwrap();
        assert_eq!(costs.len(), 1);
        assert_eq!(costs[0].account_id, "111");
        assert!(costs[0].quantity.is_none());

        let march = DateRange::new(day("2024-03-01"), day("2024-03-31")).unwrap();
        assert_eq!(provider.cost_data(&march).unwrap()[0].cost, 99.0);
    }

    #[test]
    fn files_are_read_once_per_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.jsonl");
        fs::write(&path, format!("{USAGE_LINE}\n{COST_LINE}\n")).unwrap();

        let provider = provider_for(dir.path());
        assert_eq!(provider.usage_data(&january()).unwrap().len(), 1);
        fs::remove_file(&path).unwrap();
        assert_eq!(provider.cost_data(&january()).unwrap().len(), 1);
    }

    #[test]
    fn malformed_line_names_file_and_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        fs::write(&path, format!("{COST_LINE}\n{{\"kind\":\"cost\",\"service\":1}}\n")).unwrap();

        let err = provider_for(dir.path()).cost_data(&january()).unwrap_err();
        match err {
            ProviderError::Decode { context, .. } => assert!(context.ends_with("bad.jsonl:2"), "{context}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x.jsonl"), "{\"kind\":\"invoice\"}\n").unwrap();
        let err = provider_for(dir.path()).usage_data(&january()).unwrap_err();
        assert!(matches!(err, ProviderError::Decode { .. }));
    }

    #[test]
    fn missing_directory_yields_no_records() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_for(&dir.path().join("absent"));
        assert!(provider.usage_data(&january()).unwrap().is_empty());
        assert!(provider.cost_data(&january()).unwrap().is_empty());
    }
}
