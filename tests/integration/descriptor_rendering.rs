//! Descriptor rendering scenarios with literal YAML inputs.

use appdeploy::core::DeployError;
use appdeploy::descriptor::ModuleDescriptor;
use serde_yaml::Value;
use std::collections::BTreeMap;

fn descriptor(yaml: &str) -> ModuleDescriptor {
    ModuleDescriptor::from_value(serde_yaml::from_str(yaml).unwrap()).unwrap()
}

fn overrides(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn renders_with_per_target_defaults_and_overrides() {
    let mut desc = descriptor(
        r#"
luci_gae_vars:
  app-id:
    STR_VAR: blah-1
    INT_VAR: 123
    UNUSED: "!!!"
  other-app-id:
    STR_VAR: blah-2
    INT_VAR: 456
str_key1: blah ${STR_VAR}
str_key2: blah ${INT_VAR}
int_var: ${INT_VAR}
str_var: ${STR_VAR}
a_bunch: ${ANOTHER_VAR} ${STR_VAR}
"#,
    );

    let consumed = desc
        .process(
            "app-id",
            &overrides(&[
                ("INT_VAR", "42"),
                ("ANOTHER_VAR", "zzz"),
                ("UNUSED_TOO", "!!!"),
            ]),
        )
        .unwrap();

    let rendered = desc.to_value();
    assert_eq!(
        rendered.get("str_key1"),
        Some(&Value::String("blah blah-1".into()))
    );
    assert_eq!(
        rendered.get("str_key2"),
        Some(&Value::String("blah 42".into()))
    );
    // Sole placeholder of an integer variable stays an integer.
    assert_eq!(rendered.get("int_var"), Some(&Value::Number(42.into())));
    assert_eq!(rendered.get("str_var"), Some(&Value::String("blah-1".into())));
    assert_eq!(
        rendered.get("a_bunch"),
        Some(&Value::String("zzz blah-1".into()))
    );
    assert!(rendered.get("luci_gae_vars").is_none());

    let consumed: Vec<String> = consumed.into_iter().collect();
    assert_eq!(consumed, ["ANOTHER_VAR", "INT_VAR", "STR_VAR"]);
}

#[test]
fn strips_deprecated_keys_and_sets_service() {
    let mut desc = descriptor(
        r#"
application: app
version: v
module: zzz
luci_gae_vars:
  app-id:
    ZZZ: 123
"#,
    );
    let consumed = desc.process("app-id", &BTreeMap::new()).unwrap();
    assert!(consumed.is_empty());

    let expected: Value = serde_yaml::from_str("service: zzz").unwrap();
    assert_eq!(desc.to_value(), expected);
}

#[test]
fn reports_the_first_undefined_variable() {
    let mut desc = descriptor("top: ${VAR} ${ANOTHER}");
    let err = desc.process("app-id", &BTreeMap::new()).unwrap_err();
    match err.downcast_ref::<DeployError>() {
        Some(DeployError::UndefinedVariable { name }) => assert_eq!(name, "VAR"),
        other => panic!("expected UndefinedVariable, got {other:?}"),
    }
}

#[test]
fn round_trips_through_yaml_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.yaml");
    std::fs::write(
        &path,
        "service: backend\nruntime: python312\nluci_gae_vars:\n  app-id:\n    HOST: example.com\nenv_variables:\n  HOST: ${HOST}\n",
    )
    .unwrap();

    let mut desc = ModuleDescriptor::read_yaml(&path).unwrap();
    assert_eq!(desc.name, "backend");
    assert_eq!(desc.runtime, "python312");

    desc.process("app-id", &BTreeMap::new()).unwrap();
    let dumped = desc.dump_yaml().unwrap();
    let reparsed: Value = serde_yaml::from_str(&dumped).unwrap();
    assert_eq!(
        reparsed.get("env_variables").and_then(|m| m.get("HOST")),
        Some(&Value::String("example.com".into()))
    );
}

#[test]
fn unreadable_yaml_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.yaml");
    std::fs::write(&path, ":\n  - [broken").unwrap();

    let err = ModuleDescriptor::read_yaml(&path).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DeployError>(),
        Some(DeployError::DescriptorParseError { .. })
    ));
}
