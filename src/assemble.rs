//! # Field Assembly
//!
//! Turns fetched samples into the field mapping the model expects.
//!
//! [`stack_fields`] pairs the two samples of each field into a `(2, N)`
//! tensor ordered by query time. Each catalog group then runs its own
//! [`ProcessingPipeline`] of [`FieldProcessor`]s, configured in the catalog
//! with [`ProcessorConfig`]:
//!
//! - [`GeopotentialFromHeight`]: replaces `gh_L` by `z_L = gh_L * g`.
//! - [`FieldRenamer`]: renames keys, optionally refusing any key it has no
//!   mapping for.
//!
//! Groups are merged with [`merge_fields`] and the result is compared with
//! [`expected_fields`] before it reaches the model.
//!
//! ## Configuration
//!
//! ```yaml
//! processors:
//!   - type: geopotential_from_height
//!     levels: [1000, 850, 500]
//!   - type: rename_fields
//!     strict: true
//!     mappings:
//!       sot_1: stl1
//!       vsw_1: swvl1
//! ```

use crate::catalog::{FieldGroup, ParameterCatalog, field_name};
use crate::fetch::FetchedFields;
use crate::reference::ReferenceTime;
use crate::state::{FieldMap, FieldTensor};
use chrono::{DateTime, Utc};
use log::debug;
use ndarray::{Axis, stack};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Standard acceleration of gravity, m s-2.
pub const STANDARD_GRAVITY: f64 = 9.80665;

const HEIGHT_CODE: &str = "gh";
const GEOPOTENTIAL_CODE: &str = "z";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssemblyError {
    #[error("Field '{0}' not found")]
    FieldNotFound(String),

    #[error("No mapping for field '{0}'")]
    UnmappedField(String),

    #[error("Field '{field}' has no sample for {missing:?}")]
    IncompleteSamples {
        field: String,
        missing: Vec<DateTime<Utc>>,
    },

    #[error("Field '{field}' has a sample for {date}, which is not a query time")]
    UnexpectedSampleTime { field: String, date: DateTime<Utc> },

    #[error("Field '{field}' has more than one sample for {date}")]
    DuplicateSample { field: String, date: DateTime<Utc> },

    #[error("Samples of field '{0}' have different lengths")]
    InconsistentLength(String),

    #[error("Field '{0}' is produced more than once")]
    DuplicateField(String),

    #[error("Assembled fields differ from the model inputs: missing {missing:?}, unexpected {unexpected:?}")]
    FieldSetMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

pub type AssemblyResult<T> = Result<T, AssemblyError>;

/// Builds one `(2, N)` tensor per field. Row 0 holds the `T - 6h` sample and
/// row 1 the `T` sample, whatever order they arrived in.
pub fn stack_fields(fetched: FetchedFields, reference: &ReferenceTime) -> AssemblyResult<FieldMap> {
    let times = reference.query_times();
    let mut fields = FieldMap::new();

    for (name, samples) in fetched {
        let mut rows = [None, None];
        for sample in samples {
            let slot = times.iter().position(|time| *time == sample.date).ok_or_else(|| {
                AssemblyError::UnexpectedSampleTime {
                    field: name.clone(),
                    date: sample.date,
                }
            })?;
            if rows[slot].is_some() {
                return Err(AssemblyError::DuplicateSample {
                    field: name,
                    date: sample.date,
                });
            }
            rows[slot] = Some(sample.values);
        }

        match rows {
            [Some(previous), Some(current)] => {
                let tensor = stack(Axis(0), &[previous.view(), current.view()])
                    .map_err(|_| AssemblyError::InconsistentLength(name.clone()))?;
                fields.insert(name, tensor);
            }
            _ => {
                let missing = times
                    .iter()
                    .zip(rows.iter())
                    .filter(|(_, row)| row.is_none())
                    .map(|(time, _)| *time)
                    .collect();
                return Err(AssemblyError::IncompleteSamples {
                    field: name,
                    missing,
                });
            }
        }
    }

    Ok(fields)
}

/// A transformation of a group's field mapping.
pub trait FieldProcessor: Send + Sync {
    fn process(&self, fields: FieldMap) -> AssemblyResult<FieldMap>;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Names produced from the given input names (default: unchanged).
    fn output_names(&self, input: &BTreeSet<String>) -> AssemblyResult<BTreeSet<String>> {
        Ok(input.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorConfig {
    /// Convert geopotential height to geopotential on the given levels, or on
    /// every `gh_*` field when no levels are listed
    GeopotentialFromHeight {
        #[serde(default)]
        levels: Vec<u32>,
    },
    /// Rename fields
    RenameFields {
        mappings: BTreeMap<String, String>,
        #[serde(default)]
        strict: bool,
    },
}

pub struct ProcessingPipeline {
    processors: Vec<Box<dyn FieldProcessor>>,
    name: String,
}

impl ProcessingPipeline {
    pub fn new() -> Self {
        Self::with_name("unnamed".to_string())
    }

    pub fn with_name(name: String) -> Self {
        Self {
            name,
            processors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn add_processor(&mut self, processor: Box<dyn FieldProcessor>) {
        self.processors.push(processor);
    }

    pub fn execute(&self, mut fields: FieldMap) -> AssemblyResult<FieldMap> {
        debug!(
            "Executing pipeline '{}' with {} processors on {} fields",
            self.name,
            self.processors.len(),
            fields.len()
        );

        for processor in &self.processors {
            fields = processor.process(fields)?;
            debug!(
                "Processor '{}' completed, {} fields",
                processor.name(),
                fields.len()
            );
        }

        Ok(fields)
    }

    pub fn output_names(&self, input: &BTreeSet<String>) -> AssemblyResult<BTreeSet<String>> {
        self.processors
            .iter()
            .try_fold(input.clone(), |names, processor| processor.output_names(&names))
    }
}

impl Default for ProcessingPipeline {
    fn default() -> Self {
        Self::new()
    }
}

pub fn create_processor(config: &ProcessorConfig) -> AssemblyResult<Box<dyn FieldProcessor>> {
    match config {
        ProcessorConfig::GeopotentialFromHeight { levels } => {
            Ok(Box::new(GeopotentialFromHeight::new(levels.clone())))
        }
        ProcessorConfig::RenameFields { mappings, strict } => {
            let targets: BTreeSet<&String> = mappings.values().collect();
            if targets.len() != mappings.len() {
                return Err(AssemblyError::ConfigurationError(
                    "rename_fields maps two fields onto the same name".to_string(),
                ));
            }
            Ok(Box::new(FieldRenamer::new(mappings.clone(), *strict)))
        }
    }
}

pub fn create_pipeline(name: &str, configs: &[ProcessorConfig]) -> AssemblyResult<ProcessingPipeline> {
    let mut pipeline = ProcessingPipeline::with_name(name.to_string());
    for config in configs {
        pipeline.add_processor(create_processor(config)?);
    }
    Ok(pipeline)
}

/// Replaces geopotential height by geopotential.
pub struct GeopotentialFromHeight {
    levels: Vec<u32>,
}

impl GeopotentialFromHeight {
    pub fn new(levels: Vec<u32>) -> Self {
        Self { levels }
    }

    fn height_names(&self, names: &BTreeSet<String>) -> Vec<String> {
        if self.levels.is_empty() {
            names
                .iter()
                .filter(|name| is_height_field(name))
                .cloned()
                .collect()
        } else {
            self.levels
                .iter()
                .map(|&level| field_name(HEIGHT_CODE, Some(level)))
                .collect()
        }
    }
}

fn is_height_field(name: &str) -> bool {
    name.strip_prefix(HEIGHT_CODE)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some()
}

fn geopotential_name(height_name: &str) -> String {
    format!("{}{}", GEOPOTENTIAL_CODE, &height_name[HEIGHT_CODE.len()..])
}

impl FieldProcessor for GeopotentialFromHeight {
    fn process(&self, mut fields: FieldMap) -> AssemblyResult<FieldMap> {
        let names: BTreeSet<String> = fields.keys().cloned().collect();
        for height in self.height_names(&names) {
            let tensor: FieldTensor = fields
                .remove(&height)
                .ok_or_else(|| AssemblyError::FieldNotFound(height.clone()))?;
            let target = geopotential_name(&height);
            if fields.contains_key(&target) {
                return Err(AssemblyError::DuplicateField(target));
            }
            debug!("Deriving {} from {}", target, height);
            fields.insert(target, tensor * STANDARD_GRAVITY);
        }

        if let Some(left) = fields.keys().find(|name| is_height_field(name)) {
            return Err(AssemblyError::ConfigurationError(format!(
                "'{}' is not on a converted level",
                left
            )));
        }
        Ok(fields)
    }

    fn name(&self) -> &str {
        "GeopotentialFromHeight"
    }

    fn description(&self) -> &str {
        "Converts geopotential height gh_L (gpm) to geopotential z_L (m2 s-2)"
    }

    fn output_names(&self, input: &BTreeSet<String>) -> AssemblyResult<BTreeSet<String>> {
        let mut names = input.clone();
        for height in self.height_names(input) {
            if !names.remove(&height) {
                return Err(AssemblyError::FieldNotFound(height));
            }
            names.insert(geopotential_name(&height));
        }
        Ok(names)
    }
}

/// Renames fields. In strict mode every field must have a mapping.
pub struct FieldRenamer {
    mappings: BTreeMap<String, String>,
    strict: bool,
}

impl FieldRenamer {
    pub fn new(mappings: BTreeMap<String, String>, strict: bool) -> Self {
        Self { mappings, strict }
    }

    pub fn strict(mappings: BTreeMap<String, String>) -> Self {
        Self::new(mappings, true)
    }

    fn rename(&self, name: &str) -> AssemblyResult<String> {
        match self.mappings.get(name) {
            Some(target) => Ok(target.clone()),
            None if self.strict => Err(AssemblyError::UnmappedField(name.to_string())),
            None => Ok(name.to_string()),
        }
    }
}

impl FieldProcessor for FieldRenamer {
    fn process(&self, fields: FieldMap) -> AssemblyResult<FieldMap> {
        let mut renamed = FieldMap::new();
        for (name, tensor) in fields {
            let target = self.rename(&name)?;
            if target != name {
                debug!("Renaming field '{}' to '{}'", name, target);
            }
            if renamed.insert(target.clone(), tensor).is_some() {
                return Err(AssemblyError::DuplicateField(target));
            }
        }
        Ok(renamed)
    }

    fn name(&self) -> &str {
        "FieldRenamer"
    }

    fn description(&self) -> &str {
        "Renames fields based on provided mappings"
    }

    fn output_names(&self, input: &BTreeSet<String>) -> AssemblyResult<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for name in input {
            let target = self.rename(name)?;
            if !names.insert(target.clone()) {
                return Err(AssemblyError::DuplicateField(target));
            }
        }
        Ok(names)
    }
}

/// Stacks and processes the fields of one catalog group.
pub fn assemble_group(
    group: &FieldGroup,
    fetched: FetchedFields,
    reference: &ReferenceTime,
) -> AssemblyResult<FieldMap> {
    let stacked = stack_fields(fetched, reference)?;
    create_pipeline(&group.name, &group.processors)?.execute(stacked)
}

/// Moves `group` into `fields`; a name present in both is an error.
pub fn merge_fields(fields: &mut FieldMap, group: FieldMap) -> AssemblyResult<()> {
    for (name, tensor) in group {
        if fields.contains_key(&name) {
            return Err(AssemblyError::DuplicateField(name));
        }
        fields.insert(name, tensor);
    }
    Ok(())
}

/// Field names the model receives for a catalog, after every group's
/// processors have run.
pub fn expected_fields(catalog: &ParameterCatalog) -> AssemblyResult<BTreeSet<String>> {
    let mut expected = BTreeSet::new();
    for group in &catalog.groups {
        let raw: BTreeSet<String> = group.request().field_names().into_iter().collect();
        let names = create_pipeline(&group.name, &group.processors)?.output_names(&raw)?;
        for name in names {
            if !expected.insert(name.clone()) {
                return Err(AssemblyError::DuplicateField(name));
            }
        }
    }
    Ok(expected)
}

pub fn check_field_set(fields: &FieldMap, expected: &BTreeSet<String>) -> AssemblyResult<()> {
    let actual: BTreeSet<String> = fields.keys().cloned().collect();
    let missing: Vec<String> = expected.difference(&actual).cloned().collect();
    let unexpected: Vec<String> = actual.difference(expected).cloned().collect();
    if missing.is_empty() && unexpected.is_empty() {
        Ok(())
    } else {
        Err(AssemblyError::FieldSetMismatch {
            missing,
            unexpected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::TimedSample;
    use chrono::TimeZone;
    use ndarray::{Array1, Array2, array};

    fn reference() -> ReferenceTime {
        ReferenceTime::new(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap())
    }

    fn sample(date: DateTime<Utc>, values: Vec<f64>) -> TimedSample {
        TimedSample {
            date,
            values: Array1::from(values),
        }
    }

    fn tensor(value: f64) -> FieldTensor {
        Array2::from_elem((2, 3), value)
    }

    fn soil_mappings() -> BTreeMap<String, String> {
        [("sot_1", "stl1"), ("sot_2", "stl2"), ("vsw_1", "swvl1"), ("vsw_2", "swvl2")]
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect()
    }

    #[test]
    fn test_stack_orders_rows_by_time() {
        let reference = reference();
        let [earlier, later] = reference.query_times();
        let mut fetched = FetchedFields::new();
        fetched.insert(
            "2t".to_string(),
            vec![sample(later, vec![2.0, 2.0]), sample(earlier, vec![1.0, 1.0])],
        );

        let fields = stack_fields(fetched, &reference).unwrap();
        assert_eq!(fields["2t"], array![[1.0, 1.0], [2.0, 2.0]]);
    }

    #[test]
    fn test_stack_requires_both_samples() {
        let reference = reference();
        let mut fetched = FetchedFields::new();
        fetched.insert("2t".to_string(), vec![sample(reference.date(), vec![1.0])]);

        assert_eq!(
            stack_fields(fetched, &reference),
            Err(AssemblyError::IncompleteSamples {
                field: "2t".to_string(),
                missing: vec![reference.previous()],
            })
        );
    }

    #[test]
    fn test_stack_rejects_duplicates_and_strays() {
        let reference = reference();
        let mut duplicated = FetchedFields::new();
        duplicated.insert(
            "msl".to_string(),
            vec![sample(reference.date(), vec![1.0]), sample(reference.date(), vec![1.0])],
        );
        assert!(matches!(
            stack_fields(duplicated, &reference),
            Err(AssemblyError::DuplicateSample { .. })
        ));

        let mut stray = FetchedFields::new();
        stray.insert(
            "msl".to_string(),
            vec![sample(reference.date() + chrono::Duration::hours(6), vec![1.0])],
        );
        assert!(matches!(
            stack_fields(stray, &reference),
            Err(AssemblyError::UnexpectedSampleTime { .. })
        ));
    }

    #[test]
    fn test_geopotential_from_height() {
        let mut fields = FieldMap::new();
        fields.insert("gh_500".to_string(), tensor(5500.0));
        fields.insert("gh_850".to_string(), tensor(1500.0));
        fields.insert("t_500".to_string(), tensor(250.0));

        let processed = GeopotentialFromHeight::new(vec![500, 850]).process(fields).unwrap();

        assert!(processed.keys().all(|name| !name.starts_with("gh_")));
        assert_eq!(processed["z_500"], tensor(5500.0 * STANDARD_GRAVITY));
        assert_eq!(processed["z_850"], tensor(1500.0 * STANDARD_GRAVITY));
        assert_eq!(processed["t_500"], tensor(250.0));
    }

    #[test]
    fn test_geopotential_requires_every_level() {
        let mut fields = FieldMap::new();
        fields.insert("gh_500".to_string(), tensor(1.0));
        assert_eq!(
            GeopotentialFromHeight::new(vec![500, 850]).process(fields),
            Err(AssemblyError::FieldNotFound("gh_850".to_string()))
        );
    }

    #[test]
    fn test_geopotential_without_levels_converts_all_heights() {
        let mut fields = FieldMap::new();
        fields.insert("gh_100".to_string(), tensor(1.0));
        fields.insert("gh_50".to_string(), tensor(2.0));
        let processed = GeopotentialFromHeight::new(vec![]).process(fields).unwrap();
        let names: Vec<&str> = processed.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["z_100", "z_50"]);
    }

    #[test]
    fn test_strict_rename() {
        let mut fields = FieldMap::new();
        fields.insert("sot_1".to_string(), tensor(280.0));
        fields.insert("vsw_2".to_string(), tensor(0.3));

        let renamed = FieldRenamer::strict(soil_mappings()).process(fields).unwrap();
        let names: Vec<&str> = renamed.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["stl1", "swvl2"]);
        assert_eq!(renamed["stl1"], tensor(280.0));
    }

    #[test]
    fn test_strict_rename_rejects_unknown_field() {
        let mut fields = FieldMap::new();
        fields.insert("sot_1".to_string(), tensor(280.0));
        fields.insert("sot_3".to_string(), tensor(281.0));

        assert_eq!(
            FieldRenamer::strict(soil_mappings()).process(fields),
            Err(AssemblyError::UnmappedField("sot_3".to_string()))
        );
    }

    #[test]
    fn test_lenient_rename_passes_unknown_field() {
        let mut fields = FieldMap::new();
        fields.insert("sot_3".to_string(), tensor(281.0));
        let renamed = FieldRenamer::new(soil_mappings(), false).process(fields).unwrap();
        assert!(renamed.contains_key("sot_3"));
    }

    #[test]
    fn test_processor_config_from_yaml() {
        let yaml = r#"
- type: geopotential_from_height
  levels: [500]
- type: rename_fields
  strict: true
  mappings:
    sot_1: stl1
"#;
        let configs: Vec<ProcessorConfig> = serde_yaml::from_str(yaml).unwrap();
        let pipeline = create_pipeline("test", &configs).unwrap();
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline.name(), "test");
    }

    #[test]
    fn test_rename_config_rejects_colliding_targets() {
        let mut mappings = BTreeMap::new();
        mappings.insert("a".to_string(), "c".to_string());
        mappings.insert("b".to_string(), "c".to_string());
        assert!(matches!(
            create_processor(&ProcessorConfig::RenameFields {
                mappings,
                strict: false
            }),
            Err(AssemblyError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_expected_fields_for_default_catalog() {
        let expected = expected_fields(&ParameterCatalog::default()).unwrap();
        assert_eq!(expected.len(), 12 + 4 + 78);
        assert!(expected.contains("z_500"));
        assert!(expected.contains("z"));
        assert!(expected.contains("stl1"));
        assert!(expected.contains("swvl2"));
        assert!(!expected.contains("gh_500"));
        assert!(!expected.contains("sot_1"));
    }

    #[test]
    fn test_merge_and_check() {
        let mut fields = FieldMap::new();
        let mut surface = FieldMap::new();
        surface.insert("2t".to_string(), tensor(1.0));
        merge_fields(&mut fields, surface.clone()).unwrap();
        assert_eq!(
            merge_fields(&mut fields, surface),
            Err(AssemblyError::DuplicateField("2t".to_string()))
        );

        let expected: BTreeSet<String> = ["2t", "msl"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            check_field_set(&fields, &expected),
            Err(AssemblyError::FieldSetMismatch {
                missing: vec!["msl".to_string()],
                unexpected: vec![],
            })
        );
    }
}
