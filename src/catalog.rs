//! # Parameter Catalog
//!
//! Names the variables the forecast model consumes and how they are grouped
//! for retrieval. Each [`FieldGroup`] is fetched with one request per analysis
//! time and carries the assembly steps that turn its raw fields into model
//! inputs (geopotential derivation, soil renaming).
//!
//! The default catalog is the AIFS single-level input set:
//!
//! | group    | parameters                                            | levels |
//! |----------|-------------------------------------------------------|--------|
//! | surface  | `10u 10v 2d 2t msl skt sp tcw lsm z slor sdor`         | -      |
//! | soil     | `vsw sot`                                             | 1, 2   |
//! | pressure | `gh t u v w q`                                        | 1000 ... 50 hPa (13) |

use crate::assemble::ProcessorConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

pub const PARAM_SFC: [&str; 12] = [
    "10u", "10v", "2d", "2t", "msl", "skt", "sp", "tcw", "lsm", "z", "slor", "sdor",
];
pub const PARAM_SOIL: [&str; 2] = ["vsw", "sot"];
pub const PARAM_PL: [&str; 6] = ["gh", "t", "u", "v", "w", "q"];
pub const LEVELS: [u32; 13] = [1000, 925, 850, 700, 600, 500, 400, 300, 250, 200, 150, 100, 50];
pub const SOIL_LEVELS: [u32; 2] = [1, 2];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    #[error("Catalog has no field groups")]
    Empty,

    #[error("Field group '{0}' has no parameters")]
    EmptyGroup(String),

    #[error("Field group name '{0}' is used more than once")]
    DuplicateGroup(String),

    #[error("Parameter '{param}' is listed twice in group '{group}'")]
    DuplicateParam { group: String, param: String },

    #[error("Field '{field}' is produced by groups '{first}' and '{second}'")]
    OverlappingFields {
        field: String,
        first: String,
        second: String,
    },
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Key of a field in the input state: the code for single-level variables,
/// `code_level` otherwise.
pub fn field_name(code: &str, level: Option<u32>) -> String {
    match level {
        Some(level) => format!("{}_{}", code, level),
        None => code.to_string(),
    }
}

/// A variable code and the levels it is requested on (empty for surface).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub code: String,
    #[serde(default)]
    pub levels: Vec<u32>,
}

impl VariableSpec {
    pub fn surface(code: &str) -> Self {
        Self {
            code: code.to_string(),
            levels: Vec::new(),
        }
    }

    pub fn on_levels(code: &str, levels: &[u32]) -> Self {
        Self {
            code: code.to_string(),
            levels: levels.to_vec(),
        }
    }

    pub fn field_names(&self) -> Vec<String> {
        if self.levels.is_empty() {
            vec![field_name(&self.code, None)]
        } else {
            self.levels
                .iter()
                .map(|&level| field_name(&self.code, Some(level)))
                .collect()
        }
    }
}

/// Parameters and levels retrieved together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRequest {
    pub params: Vec<String>,
    #[serde(default)]
    pub levels: Vec<u32>,
}

impl FieldRequest {
    pub fn new(params: &[&str], levels: &[u32]) -> Self {
        Self {
            params: params.iter().map(|p| p.to_string()).collect(),
            levels: levels.to_vec(),
        }
    }

    pub fn variables(&self) -> Vec<VariableSpec> {
        self.params
            .iter()
            .map(|code| VariableSpec::on_levels(code, &self.levels))
            .collect()
    }

    /// Names of the fields a complete retrieval yields.
    pub fn field_names(&self) -> Vec<String> {
        self.variables()
            .iter()
            .flat_map(VariableSpec::field_names)
            .collect()
    }
}

/// A retrieval unit plus the processors applied to its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldGroup {
    pub name: String,
    pub params: Vec<String>,
    #[serde(default)]
    pub levels: Vec<u32>,
    #[serde(default)]
    pub processors: Vec<ProcessorConfig>,
}

impl FieldGroup {
    pub fn request(&self) -> FieldRequest {
        FieldRequest {
            params: self.params.clone(),
            levels: self.levels.clone(),
        }
    }

    pub fn is_surface(&self) -> bool {
        self.levels.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterCatalog {
    pub groups: Vec<FieldGroup>,
}

impl ParameterCatalog {
    pub fn surface() -> FieldGroup {
        FieldGroup {
            name: "surface".to_string(),
            params: PARAM_SFC.iter().map(|p| p.to_string()).collect(),
            levels: Vec::new(),
            processors: Vec::new(),
        }
    }

    pub fn soil() -> FieldGroup {
        let mappings: BTreeMap<String, String> = [
            ("sot_1", "stl1"),
            ("sot_2", "stl2"),
            ("vsw_1", "swvl1"),
            ("vsw_2", "swvl2"),
        ]
        .iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect();

        FieldGroup {
            name: "soil".to_string(),
            params: PARAM_SOIL.iter().map(|p| p.to_string()).collect(),
            levels: SOIL_LEVELS.to_vec(),
            processors: vec![ProcessorConfig::RenameFields {
                mappings,
                strict: true,
            }],
        }
    }

    pub fn pressure_levels() -> FieldGroup {
        FieldGroup {
            name: "pressure".to_string(),
            params: PARAM_PL.iter().map(|p| p.to_string()).collect(),
            levels: LEVELS.to_vec(),
            processors: vec![ProcessorConfig::GeopotentialFromHeight {
                levels: LEVELS.to_vec(),
            }],
        }
    }

    pub fn group(&self, name: &str) -> Option<&FieldGroup> {
        self.groups.iter().find(|group| group.name == name)
    }

    /// Names of the raw fields fetched across all groups, before assembly.
    pub fn raw_field_names(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|group| group.request().field_names())
            .collect()
    }

    pub fn validate(&self) -> CatalogResult<()> {
        if self.groups.is_empty() {
            return Err(CatalogError::Empty);
        }

        let mut group_names = BTreeSet::new();
        let mut owners: BTreeMap<String, String> = BTreeMap::new();

        for group in &self.groups {
            if !group_names.insert(group.name.as_str()) {
                return Err(CatalogError::DuplicateGroup(group.name.clone()));
            }
            if group.params.is_empty() {
                return Err(CatalogError::EmptyGroup(group.name.clone()));
            }

            let mut params = BTreeSet::new();
            for param in &group.params {
                if !params.insert(param.as_str()) {
                    return Err(CatalogError::DuplicateParam {
                        group: group.name.clone(),
                        param: param.clone(),
                    });
                }
            }

            for field in group.request().field_names() {
                if let Some(first) = owners.insert(field.clone(), group.name.clone()) {
                    return Err(CatalogError::OverlappingFields {
                        field,
                        first,
                        second: group.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

impl Default for ParameterCatalog {
    fn default() -> Self {
        Self {
            groups: vec![Self::surface(), Self::soil(), Self::pressure_levels()],
        }
    }
}
