//! Versioned type overrides for the chain API.
//!
//! A bundle maps a runtime `specName` to a list of type tables, each valid for
//! an inclusive `minmax` range of `specVersion`s (`null` leaves a side open).

use std::collections::BTreeMap;

use error_stack::Report;
use serde_json::{Map, Value};

use crate::errors::{HarnessError, HarnessResult};

const SHADOWS_TYPES_BUNDLE: &str = include_str!("../resources/shadows-types-bundle.json");

pub type TypeDefinitions = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TypesBundle {
    #[serde(default)]
    pub spec: BTreeMap<String, OverrideBundleDefinition>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OverrideBundleDefinition {
    #[serde(default)]
    pub types: Vec<OverrideVersionedType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideVersionedType {
    pub minmax: VersionRange,
    pub types: TypeDefinitions,
}

/// Inclusive `[min, max]` spec version range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange(pub Option<u32>, pub Option<u32>);

impl VersionRange {
    pub fn contains(&self, spec_version: u32) -> bool {
        self.0.map_or(true, |min| spec_version >= min) && self.1.map_or(true, |max| spec_version <= max)
    }
}

impl TypesBundle {
    /// Bundle shipped for the Shadows runtimes.
    pub fn shadows() -> HarnessResult<TypesBundle> {
        TypesBundle::from_json(SHADOWS_TYPES_BUNDLE)
    }

    pub fn from_json(source: &str) -> HarnessResult<TypesBundle> {
        serde_json::from_str(source).map_err(|e| {
            Report::new(e)
                .change_context(HarnessError::InvalidConfig)
                .attach_printable("unable to parse types bundle")
        })
    }

    pub fn spec_names(&self) -> impl Iterator<Item = &str> {
        self.spec.keys().map(String::as_str)
    }

    /// Merges every table whose range covers `spec_version`, later entries
    /// overriding earlier ones. `None` when the runtime is not described.
    pub fn select(&self, spec_name: &str, spec_version: u32) -> Option<TypeDefinitions> {
        let definition = self.spec.get(spec_name)?;
        let mut selected: Option<TypeDefinitions> = None;
        for versioned in definition.types.iter().filter(|t| t.minmax.contains(spec_version)) {
            let merged = selected.get_or_insert_with(Map::new);
            for (name, shape) in &versioned.types {
                merged.insert(name.clone(), shape.clone());
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_builtin_bundle_covers_shadows_runtimes() {
        let bundle = TypesBundle::shadows().unwrap();
        let names: Vec<&str> = bundle.spec_names().collect();
        assert!(names.contains(&"node-shadows"));
        assert!(names.contains(&"shadows-standalone"));
        assert!(names.contains(&"ombre-alphanet"));
    }

    #[test_case(0, true, false ; "first range keeps RefCount")]
    #[test_case(4, true, false ; "upper bound is inclusive")]
    #[test_case(5, false, false ; "middle range")]
    #[test_case(6, false, true ; "open range start")]
    #[test_case(250, false, true ; "open range tail")]
    fn test_select_by_version(spec_version: u32, has_ref_count: bool, has_staking: bool) {
        let bundle = TypesBundle::shadows().unwrap();
        let types = bundle.select("node-shadows", spec_version).unwrap();
        assert_eq!(types.get("AccountId").unwrap(), "EthereumAccountId");
        assert_eq!(types.contains_key("RefCount"), has_ref_count);
        assert_eq!(types.contains_key("Candidate"), has_staking);
    }

    #[test]
    fn test_unknown_runtime_has_no_overrides() {
        let bundle = TypesBundle::shadows().unwrap();
        assert!(bundle.select("polkadot", 9000).is_none());
    }

    #[test]
    fn test_later_tables_override_earlier_ones() {
        let bundle = TypesBundle::from_json(
            r#"{"spec":{"demo":{"types":[
                {"minmax":[0,null],"types":{"Balance":"u64","Index":"u32"}},
                {"minmax":[3,null],"types":{"Balance":"u128"}}
            ]}}}"#,
        )
        .unwrap();
        let types = bundle.select("demo", 3).unwrap();
        assert_eq!(types.get("Balance").unwrap(), "u128");
        assert_eq!(types.get("Index").unwrap(), "u32");
        assert_eq!(bundle.select("demo", 2).unwrap().get("Balance").unwrap(), "u64");
    }

    #[test]
    fn test_rejects_malformed_bundle() {
        let err = TypesBundle::from_json(r#"{"spec":{"demo":{"types":[{"minmax":"all"}]}}}"#)
            .unwrap_err();
        assert_eq!(err.current_context(), &HarnessError::InvalidConfig);
    }
}
