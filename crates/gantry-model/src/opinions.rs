use crate::job::Job;
use crate::ModelError;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Deployment-wide property opinions.
///
/// The light document overrides job property defaults; the dark document
/// excludes properties from rendering. Both hold their payload under a
/// top-level `properties:` key.
#[derive(Debug, Clone, Default)]
pub struct Opinions {
    light: Value,
    dark: Value,
}

impl Opinions {
    pub fn load(light_path: &Path, dark_path: &Path) -> Result<Opinions, ModelError> {
        let light: Value = serde_yaml::from_str(&std::fs::read_to_string(light_path)?)
            .map_err(|e| ModelError::ManifestLoad {
                path: light_path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let dark: Value = serde_yaml::from_str(&std::fs::read_to_string(dark_path)?).map_err(
            |e| ModelError::ManifestLoad {
                path: dark_path.to_path_buf(),
                reason: e.to_string(),
            },
        )?;
        Self::from_values(light, dark)
    }

    pub fn from_values(light: Value, dark: Value) -> Result<Opinions, ModelError> {
        let light = light
            .get("properties")
            .cloned()
            .ok_or(ModelError::OpinionsFormat("light"))?;
        let dark = dark
            .get("properties")
            .cloned()
            .ok_or(ModelError::OpinionsFormat("dark"))?;
        Ok(Opinions { light, dark })
    }
}

/// Split a dotted property name into its key grams.
fn key_grams(name: &str) -> Vec<&str> {
    name.split('.').collect()
}

/// Walk a YAML tree along the gram path. Returns the value at the leaf, or
/// `None` when any step is missing or a non-mapping blocks descent.
fn opinion_value<'a>(tree: &'a Value, grams: &[&str]) -> Option<&'a Value> {
    let mut current = tree;
    for gram in grams {
        if !current.is_mapping() {
            return None;
        }
        current = current.get(*gram)?;
    }
    Some(current)
}

/// Insert a value at a dotted path, creating intermediate mappings. It is an
/// error for the path to cross an existing non-mapping value.
fn insert_config(props: &mut Mapping, name: &str, value: Value) -> Result<(), ModelError> {
    let grams = key_grams(name);
    let mut current = props;
    for gram in &grams[..grams.len() - 1] {
        let key = Value::String((*gram).to_owned());
        if !current.contains_key(&key) {
            current.insert(key.clone(), Value::Mapping(Mapping::new()));
        }
        current = match current.get_mut(&key) {
            Some(Value::Mapping(inner)) => inner,
            _ => {
                return Err(ModelError::PropertyConflict {
                    property: name.to_owned(),
                    segment: (*gram).to_owned(),
                })
            }
        };
    }
    current.insert(
        Value::String(grams[grams.len() - 1].to_owned()),
        value,
    );
    Ok(())
}

/// Compute the effective property tree for one job.
///
/// Per property `a.b.c.d`: a dark leaf that is neither mapping nor sequence
/// excludes the property (a missing value or an inner node does not); a
/// non-null light value overrides the job's declared default.
pub fn properties_for_job(job: &Job, opinions: &Opinions) -> Result<Mapping, ModelError> {
    let mut props = Mapping::new();
    for property in &job.properties {
        let grams = key_grams(&property.name);

        if let Some(dark_value) = opinion_value(&opinions.dark, &grams) {
            // Only a leaf value excludes. Finding a mapping or sequence means
            // the dark document goes on below this key, so `a.b.c` being
            // present does not exclude `a.b.c` itself.
            if !matches!(dark_value, Value::Mapping(_) | Value::Sequence(_)) {
                continue;
            }
        }

        let light_value = opinion_value(&opinions.light, &grams);
        let final_value = match light_value {
            Some(v) if !v.is_null() => v.clone(),
            _ => property.default.clone(),
        };
        insert_config(&mut props, &property.name, final_value)?;
    }
    Ok(props)
}

/// Flatten a nested property tree into `(joined key path, stringified
/// value)` pairs, descending into mappings *and* sequences; sequence
/// elements get numeric key segments.
pub fn flatten(props: &Mapping) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, value) in props {
        flatten_value(&scalar_to_string(key), value, &mut out);
    }
    out
}

fn flatten_value(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Mapping(mapping) => {
            for (key, inner) in mapping {
                flatten_value(&format!("{prefix}.{}", scalar_to_string(key)), inner, out);
            }
        }
        Value::Sequence(seq) => {
            for (index, inner) in seq.iter().enumerate() {
                flatten_value(&format!("{prefix}.{index}"), inner, out);
            }
        }
        other => {
            out.insert(prefix.to_owned(), scalar_to_string(other));
        }
    }
}

pub(crate) fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::Null => "~".to_owned(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobProperty;

    fn job_with_properties(props: &[(&str, Value)]) -> Job {
        Job {
            name: "test".to_owned(),
            version: "1".to_owned(),
            fingerprint: "fp".to_owned(),
            sha1: "sha".to_owned(),
            release_name: "demo".to_owned(),
            path: std::path::PathBuf::new(),
            description: String::new(),
            templates: Vec::new(),
            packages: Vec::new(),
            properties: props
                .iter()
                .map(|(name, default)| JobProperty {
                    name: (*name).to_owned(),
                    description: String::new(),
                    default: default.clone(),
                    example: Value::Null,
                })
                .collect(),
            available_providers: Default::default(),
            desired_consumers: Vec::new(),
        }
    }

    fn opinions(light: &str, dark: &str) -> Opinions {
        Opinions::from_values(
            serde_yaml::from_str(light).unwrap(),
            serde_yaml::from_str(dark).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn light_opinion_overrides_default() {
        let job = job_with_properties(&[("a.b.c", Value::from(42))]);
        let ops = opinions("properties: {a: {b: {c: 99}}}", "properties: {}");
        let props = properties_for_job(&job, &ops).unwrap();
        let c = opinion_value(&Value::Mapping(props), &["a", "b", "c"])
            .cloned()
            .unwrap();
        assert_eq!(c, Value::from(99));
    }

    #[test]
    fn null_light_opinion_falls_back_to_default() {
        let job = job_with_properties(&[("a.b.c", Value::from(42))]);
        let ops = opinions("properties: {a: {b: {c: null}}}", "properties: {}");
        let props = properties_for_job(&job, &ops).unwrap();
        let c = opinion_value(&Value::Mapping(props), &["a", "b", "c"])
            .cloned()
            .unwrap();
        assert_eq!(c, Value::from(42));
    }

    #[test]
    fn dark_leaf_excludes_property() {
        let job = job_with_properties(&[("a.b.c", Value::from(42))]);
        let ops = opinions("properties: {}", "properties: {a: {b: {c: null}}}");
        let props = properties_for_job(&job, &ops).unwrap();
        assert!(props.is_empty());
    }

    #[test]
    fn dark_map_value_does_not_exclude() {
        let job = job_with_properties(&[("a.b.c", Value::from(42))]);
        let ops = opinions("properties: {}", "properties: {a: {b: {c: {}}}}");
        let props = properties_for_job(&job, &ops).unwrap();
        assert!(!props.is_empty());
    }

    #[test]
    fn dark_inner_node_does_not_exclude_scalar_leaf() {
        // a.b present in dark does not exclude a.b.c
        let job = job_with_properties(&[("a.b.c", Value::from(1))]);
        let ops = opinions("properties: {}", "properties: {a: {b: {}}}");
        let props = properties_for_job(&job, &ops).unwrap();
        assert!(!props.is_empty());
    }

    #[test]
    fn conflicting_paths_error() {
        let job = job_with_properties(&[
            ("a.b", Value::from("scalar")),
            ("a.b.c", Value::from(1)),
        ]);
        let ops = opinions("properties: {}", "properties: {}");
        let err = properties_for_job(&job, &ops).unwrap_err();
        assert!(matches!(err, ModelError::PropertyConflict { .. }));
    }

    #[test]
    fn missing_properties_key_is_rejected() {
        let err = Opinions::from_values(
            serde_yaml::from_str("{}").unwrap(),
            serde_yaml::from_str("properties: {}").unwrap(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("light"));
    }

    #[test]
    fn flatten_descends_into_maps_and_arrays() {
        let tree: Mapping = serde_yaml::from_str(
            r#"
a:
  b: [x, y]
  c: 7
d: true
"#,
        )
        .unwrap();
        let flat = flatten(&tree);
        assert_eq!(flat["a.b.0"], "x");
        assert_eq!(flat["a.b.1"], "y");
        assert_eq!(flat["a.c"], "7");
        assert_eq!(flat["d"], "true");
    }
}
