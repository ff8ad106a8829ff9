use std::path::PathBuf;

use tessera_config::{ConfigError, ResourceItem, ResourceProvider, Workspace};

fn write_workspace(dir: &tempfile::TempDir, content: &str) -> PathBuf {
  let path = dir.path().join("workspace.json");
  std::fs::write(&path, content).unwrap();
  path
}

#[test]
fn test_load_workspace_file() {
  let dir = tempfile::tempdir().unwrap();
  let path = write_workspace(
    &dir,
    r#"{
      "mod": { "name": "aws_compliance", "title": "AWS Compliance" },
      "controls": [
        { "name": "s3_public", "sql": "select 'ok' as status, 'b' as resource, 'fine' as reason", "severity": "high" }
      ],
      "benchmarks": [
        { "name": "cis", "title": "CIS", "children": ["s3_public"] }
      ],
      "dashboards": [
        {
          "name": "overview",
          "children": [{ "type": "check", "name": "cis_check", "target": "cis" }]
        }
      ]
    }"#,
  );

  let workspace = Workspace::load(&path).unwrap();
  assert_eq!(workspace.mod_name(), "aws_compliance");
  assert_eq!(workspace.control("s3_public").unwrap().severity.as_deref(), Some("high"));

  let ResourceItem::Mod { title, children, .. } = workspace.resolve("all").unwrap() else {
    panic!("expected mod item");
  };
  assert_eq!(title.as_deref(), Some("AWS Compliance"));
  assert_eq!(children.len(), 1);
  assert_eq!(children[0].title(), "CIS");
  assert!(matches!(workspace.resolve("overview"), Ok(ResourceItem::Dashboard(_))));
}

#[test]
fn test_load_rejects_check_with_unknown_target() {
  let dir = tempfile::tempdir().unwrap();
  let path = write_workspace(
    &dir,
    r#"{
      "mod": { "name": "m" },
      "dashboards": [
        { "name": "d", "children": [{ "type": "check", "name": "c", "target": "nope" }] }
      ]
    }"#,
  );
  assert_eq!(
    Workspace::load(&path).unwrap_err(),
    ConfigError::DanglingReference {
      parent: "c".to_string(),
      child: "nope".to_string()
    }
  );
}

#[test]
fn test_load_rejects_duplicate_dashboard_nodes() {
  let dir = tempfile::tempdir().unwrap();
  let path = write_workspace(
    &dir,
    r#"{
      "mod": { "name": "m" },
      "dashboards": [{
        "name": "d",
        "children": [
          { "type": "text", "name": "t" },
          { "type": "container", "name": "box", "children": [{ "type": "text", "name": "t" }] }
        ]
      }]
    }"#,
  );
  assert!(matches!(
    Workspace::load(&path),
    Err(ConfigError::DuplicateName { .. })
  ));
}

#[test]
fn test_load_reports_missing_file() {
  let dir = tempfile::tempdir().unwrap();
  let error = Workspace::load(&dir.path().join("missing.json")).unwrap_err();
  assert!(matches!(error, ConfigError::Read { .. }));
}
