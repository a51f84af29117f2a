// Copyright 2026 The DataLad Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs;

use datalad_lib::config::ConfigManager;
use datalad_lib::config::ConfigScope;
use testutils::new_temp_dir;
use testutils::scaffold_dataset;

/// All six sources loaded together resolve in the documented order.
#[test]
fn test_full_precedence_chain() {
    let dir = new_temp_dir();
    let root = dir.path().join("ds");
    scaffold_dataset(&root);

    let system = dir.path().join("system-config");
    let user = dir.path().join("user-config");
    fs::write(&system, "[datalad]\n\twitness = system\n").unwrap();
    fs::write(&user, "[datalad]\n\twitness = user\n").unwrap();
    fs::create_dir_all(root.join(".datalad")).unwrap();
    fs::write(
        root.join(".datalad/config"),
        "[datalad]\n\twitness = branch\n",
    )
    .unwrap();
    fs::write(
        root.join(".git/config"),
        "[datalad]\n\twitness = local\n",
    )
    .unwrap();

    let load = |env: Vec<(String, String)>, cli: bool| {
        let mut builder = ConfigManager::builder()
            .system_file(&system)
            .user_file(&user)
            .dataset_root(&root)
            .env_vars(env);
        if cli {
            builder = builder.cli_override("datalad.witness", "cli");
        }
        builder.load().unwrap()
    };

    let base = load(vec![], false);
    assert_eq!(base.get("datalad.witness"), Some("local"));
    assert_eq!(
        base.get_all("datalad.witness"),
        ["system", "user", "branch", "local"]
    );

    let env = vec![("DATALAD_WITNESS".to_string(), "env".to_string())];
    let with_env = load(env.clone(), false);
    assert_eq!(with_env.get("datalad.witness"), Some("env"));

    let with_cli = load(env, true);
    assert_eq!(with_cli.get("datalad.witness"), Some("cli"));
}

/// Write/read law: a value written to a scope is returned by get, modulo
/// higher-precedence overrides.
#[test]
fn test_scoped_write_read_law() {
    let dir = new_temp_dir();
    let root = dir.path().join("ds");
    scaffold_dataset(&root);

    let mut config = ConfigManager::builder()
        .system_file(dir.path().join("no-system"))
        .user_file(dir.path().join("no-user"))
        .dataset_root(&root)
        .env_vars(vec![])
        .load()
        .unwrap();

    config
        .set("datalad.example.answer", "42", ConfigScope::Branch)
        .unwrap();
    assert_eq!(config.get("datalad.example.answer"), Some("42"));

    // A local-scope write shadows the branch value.
    config
        .set("datalad.example.answer", "43", ConfigScope::Local)
        .unwrap();
    assert_eq!(config.get("datalad.example.answer"), Some("43"));
    assert_eq!(config.get_all("datalad.example.answer"), ["42", "43"]);

    // The branch write landed in the committed-config file, staged for
    // the caller to commit.
    let branch_file = fs::read_to_string(root.join(".datalad/config")).unwrap();
    assert!(branch_file.contains("answer = 42"));
}

/// Branch configuration is readable without a working tree, from blob
/// content handed in by the caller.
#[test]
fn test_branch_scope_from_bare_blob() {
    let config = ConfigManager::builder()
        .system_file("/nonexistent/system")
        .user_file("/nonexistent/user")
        .env_vars(vec![])
        .branch_blob(b"[datalad \"dataset\"]\n\tid = from-a-bare-clone\n".to_vec())
        .load()
        .unwrap();
    assert_eq!(config.get("datalad.dataset.id"), Some("from-a-bare-clone"));
}

/// Two managers over the same dataset: the reader observes a writer's
/// value after reload, detected by file fingerprint.
#[test]
fn test_reader_sees_writers_value_after_reload() {
    let dir = new_temp_dir();
    let root = dir.path().join("ds");
    scaffold_dataset(&root);
    let build = || {
        ConfigManager::builder()
            .system_file(dir.path().join("no-system"))
            .user_file(dir.path().join("no-user"))
            .dataset_root(&root)
            .env_vars(vec![])
            .load()
            .unwrap()
    };
    let mut writer = build();
    let mut reader = build();
    writer
        .set("datalad.shared.value", "one", ConfigScope::Local)
        .unwrap();
    reader.reload().unwrap();
    assert_eq!(reader.get("datalad.shared.value"), Some("one"));
}
