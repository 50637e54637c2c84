//! Versioned per-gas, per-region exposure limits.
//!
//! A [`LimitTable`] is validated once when it is built and never mutated
//! afterwards. The [`LimitRegistry`] hands out `Arc` snapshots; a reload swaps
//! the snapshot reference, so evaluations already holding the previous
//! snapshot keep seeing one consistent version.

use crate::core::types::{GasId, RegionId};
use crate::core::windowing::WindowSpec;
use crate::error::ConfigError;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Largest number of decimal places a gas may be rounded to.
const MAX_ROUNDING_DECIMALS: u32 = 6;

/// Measurable range of a gas sensor, in ppm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorRange {
    pub min: f64,
    pub max: f64,
}

/// One configured limit as written in the limits file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitEntry {
    pub gas: GasId,
    pub region: RegionId,
    pub window: String,
    pub value: f64,
}

/// On-disk limits document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsFile {
    /// Operator-visible version label, e.g. `eu-2024-01`
    pub version: String,
    /// Gases the devices have sensors for
    pub gases: Vec<GasId>,
    /// Active window specifications
    #[serde(default = "WindowSpec::standard_windows")]
    pub windows: Vec<WindowSpec>,
    pub limits: Vec<LimitEntry>,
    #[serde(default)]
    pub sensor_ranges: HashMap<GasId, SensorRange>,
    /// Decimal places that are meaningful for each gas
    #[serde(default)]
    pub rounding_decimals: HashMap<GasId, u32>,
}

impl LimitsFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))
    }
}

/// Lookup key for a single limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LimitKey {
    pub gas: GasId,
    pub region: RegionId,
    pub window: String,
}

impl LimitKey {
    pub fn new(gas: &str, region: &str, window: &str) -> Self {
        Self {
            gas: gas.to_string(),
            region: region.to_string(),
            window: window.to_string(),
        }
    }
}

/// A threshold value for one (gas, region, window).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    pub gas: GasId,
    pub region: RegionId,
    pub window: String,
    /// Concentration in ppm that must not be reached or exceeded
    pub value: f64,
    /// Version label of the table this limit came from
    pub version: String,
}

/// Immutable, validated limit table.
#[derive(Debug, Clone)]
pub struct LimitTable {
    version: String,
    /// Monotonic counter assigned by the registry on every install
    generation: u64,
    gases: Vec<GasId>,
    windows: Vec<WindowSpec>,
    regions: BTreeSet<RegionId>,
    limits: HashMap<LimitKey, Limit>,
    sensor_ranges: HashMap<GasId, SensorRange>,
    rounding_decimals: HashMap<GasId, u32>,
}

impl LimitTable {
    /// Load and validate a limits file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_limits_file(LimitsFile::load(path)?)
    }

    /// Validate a parsed limits document, collecting every issue before failing.
    pub fn from_limits_file(file: LimitsFile) -> Result<Self, ConfigError> {
        let mut issues = Vec::new();

        if file.gases.is_empty() {
            issues.push("'gases' must list at least one gas".to_string());
        }
        let known_gases: HashSet<&str> = file.gases.iter().map(String::as_str).collect();
        if known_gases.len() != file.gases.len() {
            issues.push(format!("'gases' contains duplicates: {:?}", file.gases));
        }

        if file.windows.is_empty() {
            issues.push("'windows' must list at least one window".to_string());
        }
        let mut window_names = HashSet::new();
        for window in &file.windows {
            if !window_names.insert(window.name.as_str()) {
                issues.push(format!("window '{}' is defined more than once", window.name));
            }
            if window.minutes == 0 {
                issues.push(format!("window '{}' must be longer than 0 minutes", window.name));
            }
            if let Some(gases) = &window.gases {
                for gas in gases.iter().filter(|g| !known_gases.contains(g.as_str())) {
                    issues.push(format!(
                        "window '{}' refers to unsupported gas '{gas}'",
                        window.name
                    ));
                }
            }
        }

        let mut limits = HashMap::new();
        let mut regions = BTreeSet::new();
        for entry in &file.limits {
            if !known_gases.contains(entry.gas.as_str()) {
                issues.push(format!(
                    "limit for unsupported gas '{}' (region '{}', window '{}')",
                    entry.gas, entry.region, entry.window
                ));
                continue;
            }
            if !window_names.contains(entry.window.as_str()) {
                issues.push(format!(
                    "limit for unknown window '{}' (gas '{}', region '{}')",
                    entry.window, entry.gas, entry.region
                ));
                continue;
            }
            if !(entry.value.is_finite() && entry.value > 0.0) {
                issues.push(format!(
                    "limit for '{}'/'{}'/'{}' must be a positive number, but is {}",
                    entry.gas, entry.region, entry.window, entry.value
                ));
            }

            regions.insert(entry.region.clone());
            let key = LimitKey::new(&entry.gas, &entry.region, &entry.window);
            let limit = Limit {
                gas: entry.gas.clone(),
                region: entry.region.clone(),
                window: entry.window.clone(),
                value: entry.value,
                version: file.version.clone(),
            };
            if limits.insert(key, limit).is_some() {
                issues.push(format!(
                    "limit for '{}'/'{}'/'{}' is defined more than once",
                    entry.gas, entry.region, entry.window
                ));
            }
        }

        if regions.is_empty() {
            issues.push("'limits' must configure at least one region".to_string());
        }

        // Every active (gas, region, window) must have a limit, otherwise an
        // exceedance for that key would go undetected.
        for region in &regions {
            for gas in &file.gases {
                for window in file.windows.iter().filter(|w| w.applies_to(gas)) {
                    if !limits.contains_key(&LimitKey::new(gas, region, &window.name)) {
                        issues.push(format!(
                            "no limit configured for gas '{gas}', region '{region}', window '{}'",
                            window.name
                        ));
                    }
                }
            }
        }

        for (gas, range) in &file.sensor_ranges {
            if !(range.min < range.max) {
                issues.push(format!(
                    "sensor range for '{gas}' is empty (min: {}, max: {})",
                    range.min, range.max
                ));
                continue;
            }
            let values: Vec<f64> = limits
                .values()
                .filter(|l| &l.gas == gas)
                .map(|l| l.value)
                .collect();
            let Some(largest) = values.iter().copied().reduce(f64::max) else {
                continue;
            };
            let smallest = values.iter().copied().fold(f64::INFINITY, f64::min);
            if smallest < range.min || largest > range.max {
                issues.push(format!(
                    "limits {values:?} for '{gas}' fall outside the sensor range (min: {}, max: {})",
                    range.min, range.max
                ));
            } else if largest * 2.0 > range.max {
                tracing::warn!(
                    gas = %gas,
                    largest_limit = largest,
                    sensor_max = range.max,
                    "Sensor range is less than twice the largest limit; averages near the limit may read as range exceeded"
                );
            }
        }

        for (gas, decimals) in &file.rounding_decimals {
            if *decimals > MAX_ROUNDING_DECIMALS {
                issues.push(format!(
                    "rounding for '{gas}' should be at most {MAX_ROUNDING_DECIMALS} decimals, but is {decimals}"
                ));
            }
        }

        if !issues.is_empty() {
            for issue in &issues {
                tracing::error!(issue = %issue, "Limit configuration issue");
            }
            return Err(ConfigError::Invalid(issues));
        }

        Ok(Self {
            version: file.version,
            generation: 0,
            gases: file.gases,
            windows: file.windows,
            regions,
            limits,
            sensor_ranges: file.sensor_ranges,
            rounding_decimals: file.rounding_decimals,
        })
    }

    /// Look up the limit for a key, if one is configured.
    pub fn lookup(&self, gas: &str, region: &str, window: &str) -> Option<&Limit> {
        self.limits.get(&LimitKey::new(gas, region, window))
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn gases(&self) -> &[GasId] {
        &self.gases
    }

    pub fn windows(&self) -> &[WindowSpec] {
        &self.windows
    }

    pub fn has_region(&self, region: &str) -> bool {
        self.regions.contains(region)
    }

    pub fn regions(&self) -> impl Iterator<Item = &RegionId> {
        self.regions.iter()
    }

    /// Fail unless every region in `regions` has limits configured.
    pub fn ensure_regions<'a, I>(&self, regions: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let missing: BTreeSet<&str> = regions
            .into_iter()
            .filter(|region| !self.has_region(region))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let issues: Vec<String> = missing
            .into_iter()
            .map(|region| {
                format!(
                    "limits version '{}' configures no limits for region '{region}', which has firefighters assigned",
                    self.version
                )
            })
            .collect();
        for issue in &issues {
            tracing::error!(issue = %issue, "Limit configuration issue");
        }
        Err(ConfigError::Invalid(issues))
    }

    /// Windows evaluated for a gas.
    pub fn windows_for_gas<'a>(&'a self, gas: &'a str) -> impl Iterator<Item = &'a WindowSpec> + 'a {
        self.windows.iter().filter(move |w| w.applies_to(gas))
    }

    /// Every (gas, window, limit) evaluated for firefighters in `region`.
    pub fn required_keys<'a>(
        &'a self,
        region: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a WindowSpec, &'a Limit)> + 'a {
        self.gases.iter().flat_map(move |gas| {
            self.windows_for_gas(gas).filter_map(move |window| {
                self.lookup(gas, region, &window.name)
                    .map(|limit| (gas.as_str(), window, limit))
            })
        })
    }

    /// Length of the longest active window; how far back a tick must read.
    pub fn longest_window(&self) -> Duration {
        self.windows
            .iter()
            .map(WindowSpec::duration)
            .max()
            .unwrap_or_else(Duration::zero)
    }

    pub fn rounding_for(&self, gas: &str) -> Option<u32> {
        self.rounding_decimals.get(gas).copied()
    }

    pub fn sensor_range(&self, gas: &str) -> Option<SensorRange> {
        self.sensor_ranges.get(gas).copied()
    }

    /// The table as a limits document, e.g. for display or export.
    pub fn to_limits_file(&self) -> LimitsFile {
        LimitsFile {
            version: self.version.clone(),
            gases: self.gases.clone(),
            windows: self.windows.clone(),
            limits: self
                .entries()
                .into_iter()
                .map(|l| LimitEntry {
                    gas: l.gas.clone(),
                    region: l.region.clone(),
                    window: l.window.clone(),
                    value: l.value,
                })
                .collect(),
            sensor_ranges: self.sensor_ranges.clone(),
            rounding_decimals: self.rounding_decimals.clone(),
        }
    }

    /// All configured limits, sorted by gas, region, window.
    pub fn entries(&self) -> Vec<&Limit> {
        let mut entries: Vec<&Limit> = self.limits.values().collect();
        entries.sort_by(|a, b| {
            (&a.gas, &a.region, &a.window).cmp(&(&b.gas, &b.region, &b.window))
        });
        entries
    }
}

/// Holds the active limit table and swaps it atomically on reload.
#[derive(Debug)]
pub struct LimitRegistry {
    current: RwLock<Arc<LimitTable>>,
    generations: AtomicU64,
    /// Regions every installed table must cover
    required_regions: RwLock<BTreeSet<RegionId>>,
}

impl LimitRegistry {
    pub fn new(mut table: LimitTable) -> Self {
        table.generation = 1;
        Self {
            current: RwLock::new(Arc::new(table)),
            generations: AtomicU64::new(1),
            required_regions: RwLock::new(BTreeSet::new()),
        }
    }

    /// Load, validate and wrap a limits file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::new(LimitTable::from_file(path)?))
    }

    /// The current snapshot. Callers keep it for the whole tick.
    pub fn snapshot(&self) -> Arc<LimitTable> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Install a new table. Returns the generation assigned to it.
    pub fn replace(&self, mut table: LimitTable) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        table.generation = generation;
        let table = Arc::new(table);
        match self.current.write() {
            Ok(mut guard) => *guard = table,
            Err(poisoned) => *poisoned.into_inner() = table,
        }
        generation
    }

    /// Require the current table and every reloaded one to cover `regions`.
    ///
    /// Nothing is recorded when the current table already misses one of them.
    pub fn require_regions<I, S>(&self, regions: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<RegionId>,
    {
        let regions: BTreeSet<RegionId> = regions.into_iter().map(Into::into).collect();
        self.snapshot()
            .ensure_regions(regions.iter().map(String::as_str))?;
        match self.required_regions.write() {
            Ok(mut guard) => guard.extend(regions),
            Err(poisoned) => poisoned.into_inner().extend(regions),
        }
        Ok(())
    }

    pub fn required_regions(&self) -> BTreeSet<RegionId> {
        match self.required_regions.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Reload from disk. An invalid file, or one that drops a required
    /// region, leaves the current table in place.
    pub fn reload(&self, path: &Path) -> Result<u64, ConfigError> {
        let table = LimitTable::from_file(path)?;
        table.ensure_regions(self.required_regions().iter().map(String::as_str))?;
        let version = table.version.clone();
        let generation = self.replace(table);
        tracing::info!(version = %version, generation, "Limit table reloaded");
        Ok(generation)
    }

    pub fn version(&self) -> String {
        self.snapshot().version.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::windowing::WindowKind;

    pub(crate) fn entry(gas: &str, region: &str, window: &str, value: f64) -> LimitEntry {
        LimitEntry {
            gas: gas.to_string(),
            region: region.to_string(),
            window: window.to_string(),
            value,
        }
    }

    pub(crate) fn two_window_file() -> LimitsFile {
        LimitsFile {
            version: "test-1".to_string(),
            gases: vec!["carbon_monoxide".to_string()],
            windows: vec![
                WindowSpec::new("STEL-15m", 15, WindowKind::Twa),
                WindowSpec::new("TWA-8h", 480, WindowKind::Twa),
            ],
            limits: vec![
                entry("carbon_monoxide", "EU", "STEL-15m", 100.0),
                entry("carbon_monoxide", "EU", "TWA-8h", 25.0),
            ],
            sensor_ranges: HashMap::new(),
            rounding_decimals: HashMap::new(),
        }
    }

    pub(crate) fn table() -> LimitTable {
        LimitTable::from_limits_file(two_window_file()).unwrap()
    }

    #[test]
    fn test_lookup() {
        let table = LimitTable::from_limits_file(two_window_file()).unwrap();
        let limit = table.lookup("carbon_monoxide", "EU", "TWA-8h").unwrap();
        assert_eq!(limit.value, 25.0);
        assert_eq!(limit.version, "test-1");
        assert!(table.lookup("carbon_monoxide", "US", "TWA-8h").is_none());
        assert_eq!(table.longest_window(), Duration::minutes(480));
    }

    #[test]
    fn test_missing_limit_is_configuration_error() {
        let mut file = two_window_file();
        file.limits.pop();
        let err = LimitTable::from_limits_file(file).unwrap_err();
        match err {
            ConfigError::Invalid(issues) => {
                assert_eq!(issues.len(), 1);
                assert!(issues[0].contains("TWA-8h"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_ceiling_window_limited_to_subset_of_gases() {
        let mut file = two_window_file();
        file.gases.push("nitrogen_dioxide".to_string());
        file.windows
            .push(WindowSpec::new("C-15m", 15, WindowKind::Ceiling).for_gases(["carbon_monoxide"]));
        file.limits.extend([
            entry("carbon_monoxide", "EU", "C-15m", 200.0),
            entry("nitrogen_dioxide", "EU", "STEL-15m", 1.0),
            entry("nitrogen_dioxide", "EU", "TWA-8h", 0.5),
        ]);

        let table = LimitTable::from_limits_file(file).unwrap();
        assert_eq!(table.required_keys("EU").count(), 5);
        assert_eq!(table.windows_for_gas("nitrogen_dioxide").count(), 2);
    }

    #[test]
    fn test_duplicate_and_unknown_entries_collected() {
        let mut file = two_window_file();
        file.limits.push(entry("carbon_monoxide", "EU", "TWA-8h", 30.0));
        file.limits.push(entry("ozone", "EU", "TWA-8h", 0.1));
        file.limits.push(entry("carbon_monoxide", "EU", "TWA-1y", 0.1));

        let err = LimitTable::from_limits_file(file).unwrap_err();
        let ConfigError::Invalid(issues) = err else {
            panic!("expected validation failure");
        };
        assert_eq!(issues.len(), 3);
    }

    #[test]
    fn test_limits_outside_sensor_range_rejected() {
        let mut file = two_window_file();
        file.sensor_ranges
            .insert("carbon_monoxide".into(), SensorRange { min: 1.0, max: 50.0 });
        assert!(LimitTable::from_limits_file(file).is_err());
    }

    #[test]
    fn test_registry_snapshot_survives_reload() {
        let registry = LimitRegistry::new(LimitTable::from_limits_file(two_window_file()).unwrap());
        let before = registry.snapshot();
        assert_eq!(before.generation(), 1);

        let mut file = two_window_file();
        file.version = "test-2".to_string();
        file.limits[1].value = 20.0;
        let generation = registry.replace(LimitTable::from_limits_file(file).unwrap());

        assert_eq!(generation, 2);
        assert_eq!(before.lookup("carbon_monoxide", "EU", "TWA-8h").unwrap().value, 25.0);
        let after = registry.snapshot();
        assert_eq!(after.version(), "test-2");
        assert_eq!(after.lookup("carbon_monoxide", "EU", "TWA-8h").unwrap().value, 20.0);
    }

    #[test]
    fn test_table_without_assigned_region_is_rejected() {
        let table = table();
        assert!(table.ensure_regions(["EU"]).is_ok());

        match table.ensure_regions(["EU", "US", "US"]).unwrap_err() {
            ConfigError::Invalid(issues) => {
                assert_eq!(issues.len(), 1);
                assert!(issues[0].contains("'US'"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_reload_keeps_table_when_required_region_is_dropped() {
        let registry = LimitRegistry::new(table());
        assert!(registry.require_regions(["US"]).is_err());
        assert!(registry.required_regions().is_empty());
        registry.require_regions(["EU"]).unwrap();

        let mut file = two_window_file();
        file.version = "us-only".to_string();
        for entry in &mut file.limits {
            entry.region = "US".to_string();
        }
        let path = std::env::temp_dir().join(format!("exposure-limits-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();

        let err = registry.reload(&path).unwrap_err();
        assert!(err.to_string().contains("'EU'"));
        assert_eq!(registry.version(), "test-1");
        assert_eq!(registry.snapshot().generation(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_limits_file_defaults_to_standard_windows() {
        let json = r#"{
            "version": "v1",
            "gases": ["carbon_monoxide"],
            "limits": [
                {"gas": "carbon_monoxide", "region": "EU", "window": "STEL-10m", "value": 420},
                {"gas": "carbon_monoxide", "region": "EU", "window": "STEL-15m", "value": 420},
                {"gas": "carbon_monoxide", "region": "EU", "window": "TWA-30m", "value": 150},
                {"gas": "carbon_monoxide", "region": "EU", "window": "TWA-60m", "value": 83},
                {"gas": "carbon_monoxide", "region": "EU", "window": "TWA-4h", "value": 33},
                {"gas": "carbon_monoxide", "region": "EU", "window": "TWA-8h", "value": 27}
            ]
        }"#;
        let file: LimitsFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.windows.len(), 6);
        let table = LimitTable::from_limits_file(file).unwrap();
        assert_eq!(table.required_keys("EU").count(), 6);
    }
}
