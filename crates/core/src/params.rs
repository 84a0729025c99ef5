//! Parameter registry.
//!
//! One `define_params!` invocation is the single source of truth: it
//! declares every tunable's field, type, default, and wire name, and
//! generates the typed struct plus the string-keyed set/get/format surface
//! the config layer drives. Names match case-insensitively.

use serde::{Deserialize, Serialize};

use crate::config;
use crate::distance::DistCalcMethod;
use crate::error::{EngineError, Result};

fn default_threads() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

macro_rules! define_params {
    ($(($field:ident, $ty:ty, $default:expr, $name:literal)),+ $(,)?) => {
        /// Registered index parameters with their current values.
        #[derive(Debug, Clone, Serialize, Deserialize)]
        pub struct Params {
            $(pub $field: $ty,)+
        }

        impl Default for Params {
            fn default() -> Self {
                Self {
                    $($field: $default,)+
                }
            }
        }

        impl Params {
            /// Parse `value` into the parameter's declared type and assign
            /// it. Unknown names and unparseable values fail without
            /// changing anything.
            pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
                $(
                    if name.eq_ignore_ascii_case($name) {
                        self.$field = value.trim().parse::<$ty>().map_err(|_| {
                            EngineError::Fail(format!(
                                concat!("cannot parse '{}' as ", $name),
                                value
                            ))
                        })?;
                        return Ok(());
                    }
                )+
                Err(EngineError::Fail(format!("unknown parameter '{name}'")))
            }

            /// Format the current value of a parameter.
            pub fn get(&self, name: &str) -> Option<String> {
                $(
                    if name.eq_ignore_ascii_case($name) {
                        return Some(self.$field.to_string());
                    }
                )+
                None
            }

            /// Write every parameter as a `key=value` line.
            pub fn write_all<W: std::io::Write + ?Sized>(&self, w: &mut W) -> std::io::Result<()> {
                $(writeln!(w, concat!($name, "={}"), self.$field)?;)+
                Ok(())
            }
        }
    };
}

define_params!(
    (number_of_threads, usize, default_threads(), "NumberOfThreads"),
    (dist_calc_method, DistCalcMethod, DistCalcMethod::L2, "DistCalcMethod"),
    (max_check, usize, config::DEFAULT_MAX_CHECK, "MaxCheck"),
    (
        no_better_propagation_threshold,
        usize,
        config::DEFAULT_NO_BETTER_PROPAGATION_THRESHOLD,
        "ThresholdOfNumberOfContinuousNoBetterPropagation"
    ),
    (
        initial_dynamic_pivots,
        usize,
        config::DEFAULT_INITIAL_DYNAMIC_PIVOTS,
        "NumberOfInitialDynamicPivots"
    ),
    (
        other_dynamic_pivots,
        usize,
        config::DEFAULT_OTHER_DYNAMIC_PIVOTS,
        "NumberOfOtherDynamicPivots"
    ),
    (
        neighborhood_size,
        usize,
        config::DEFAULT_NEIGHBORHOOD_SIZE,
        "NeighborhoodSize"
    ),
    (cef, usize, config::DEFAULT_CEF, "CEF"),
    (add_cef, usize, config::DEFAULT_ADD_CEF, "AddCEF"),
    (
        max_check_for_refine_graph,
        usize,
        config::DEFAULT_MAX_CHECK_FOR_REFINE_GRAPH,
        "MaxCheckForRefineGraph"
    ),
    (number_of_trees, usize, config::DEFAULT_NUMBER_OF_TREES, "NumberOfTrees"),
    (
        top_dimensions_in_tree_node,
        usize,
        config::DEFAULT_TOP_DIMENSIONS_IN_TREE_NODE,
        "TopDimensionsInTreeNode"
    ),
    (
        samples_per_node_in_tree,
        usize,
        config::DEFAULT_SAMPLES_PER_NODE,
        "SamplesPerNodeInTree"
    ),
    (
        hash_table_exponent,
        u32,
        config::DEFAULT_HASH_TABLE_EXPONENT,
        "HashTableExponent"
    ),
    (data_block_size, usize, config::DEFAULT_DATA_BLOCK_SIZE, "DataBlockSize"),
    (data_capacity, usize, config::DEFAULT_DATA_CAPACITY, "DataCapacity"),
    (meta_record_size, usize, config::DEFAULT_META_RECORD_SIZE, "MetaRecordSize"),
    (
        add_count_for_rebuild_trees,
        usize,
        config::DEFAULT_ADD_COUNT_FOR_REBUILD_TREES,
        "AddCountForRebuildTrees"
    ),
);

impl std::str::FromStr for Params {
    type Err = EngineError;

    /// Parse `key=value` lines (an `[Index]` section; section headers and
    /// blank lines are skipped).
    fn from_str(s: &str) -> Result<Self> {
        let mut params = Params::default();
        params.merge_config(s)?;
        Ok(params)
    }
}

impl Params {
    /// Apply `key=value` lines on top of the current values.
    pub fn merge_config(&mut self, text: &str) -> Result<()> {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('[') || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| EngineError::Fail(format!("malformed config line '{line}'")))?;
            self.set(key.trim(), value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let p = Params::default();
        assert_eq!(p.max_check, config::DEFAULT_MAX_CHECK);
        assert_eq!(p.dist_calc_method, DistCalcMethod::L2);
        assert!(p.number_of_threads >= 1);
    }

    #[test]
    fn test_set_and_get_case_insensitive() {
        let mut p = Params::default();
        p.set("maxcheck", "123").unwrap();
        assert_eq!(p.max_check, 123);
        assert_eq!(p.get("MAXCHECK").unwrap(), "123");
        p.set("DistCalcMethod", "cosine").unwrap();
        assert_eq!(p.dist_calc_method, DistCalcMethod::Cosine);
        assert_eq!(p.get("DistCalcMethod").unwrap(), "Cosine");
    }

    #[test]
    fn test_set_bad_value_keeps_old() {
        let mut p = Params::default();
        p.set("MaxCheck", "64").unwrap();
        assert!(p.set("MaxCheck", "not-a-number").is_err());
        assert_eq!(p.max_check, 64);
    }

    #[test]
    fn test_unknown_name_fails() {
        let mut p = Params::default();
        assert!(p.set("NoSuchParameter", "1").is_err());
        assert!(p.get("NoSuchParameter").is_none());
    }

    #[test]
    fn test_write_all_round_trips() {
        let mut p = Params::default();
        p.set("NeighborhoodSize", "12").unwrap();
        p.set("DistCalcMethod", "Cosine").unwrap();
        let mut out = Vec::new();
        p.write_all(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let parsed: Params = text.parse().unwrap();
        assert_eq!(parsed.neighborhood_size, 12);
        assert_eq!(parsed.dist_calc_method, DistCalcMethod::Cosine);
        assert_eq!(parsed.max_check, p.max_check);
    }

    #[test]
    fn test_every_registered_name_is_gettable() {
        let p = Params::default();
        for name in [
            "NumberOfThreads",
            "DistCalcMethod",
            "MaxCheck",
            "ThresholdOfNumberOfContinuousNoBetterPropagation",
            "NumberOfInitialDynamicPivots",
            "NumberOfOtherDynamicPivots",
            "NeighborhoodSize",
            "CEF",
            "AddCEF",
            "MaxCheckForRefineGraph",
            "NumberOfTrees",
            "TopDimensionsInTreeNode",
            "SamplesPerNodeInTree",
            "HashTableExponent",
            "DataBlockSize",
            "DataCapacity",
            "MetaRecordSize",
            "AddCountForRebuildTrees",
        ] {
            assert!(p.get(name).is_some(), "missing parameter {name}");
        }
    }
}
