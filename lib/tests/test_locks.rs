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

use std::sync::Arc;
use std::sync::Barrier;
use std::time::Duration;

use datalad_lib::config::ConfigManager;
use datalad_lib::config::ConfigScope;
use datalad_lib::lock;
use testutils::new_temp_dir;
use testutils::scaffold_dataset;

/// Concurrent scope-file writers serialize on the advisory lock; no
/// update is lost.
#[test]
fn test_concurrent_config_writers_do_not_lose_updates() {
    let dir = new_temp_dir();
    let root = Arc::new(dir.path().join("ds"));
    scaffold_dataset(&root);
    let no_system = Arc::new(dir.path().join("no-system"));
    let no_user = Arc::new(dir.path().join("no-user"));

    let barrier = Arc::new(Barrier::new(4));
    let mut handles = vec![];
    for i in 0..4 {
        let root = root.clone();
        let no_system = no_system.clone();
        let no_user = no_user.clone();
        let barrier = barrier.clone();
        handles.push(std::thread::spawn(move || {
            let mut config = ConfigManager::builder()
                .system_file(no_system.as_path())
                .user_file(no_user.as_path())
                .dataset_root(root.as_path())
                .env_vars(vec![])
                .load()
                .unwrap();
            barrier.wait();
            config
                .set(&format!("datalad.writer.w{i}"), &i.to_string(), ConfigScope::Local)
                .unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let config = ConfigManager::builder()
        .system_file(no_system.as_path())
        .user_file(no_user.as_path())
        .dataset_root(root.as_path())
        .env_vars(vec![])
        .load()
        .unwrap();
    for i in 0..4 {
        assert_eq!(
            config.get(&format!("datalad.writer.w{i}")),
            Some(i.to_string().as_str()),
            "writer {i} lost its update"
        );
    }
}

/// A held lock blocks contenders until released, then the next one
/// proceeds.
#[test]
fn test_lock_handover() {
    let dir = new_temp_dir();
    let path = dir.path().join("resource.lck");
    let guard = lock::acquire(&path, Duration::from_secs(1), None).unwrap();

    let contender_path = path.clone();
    let contender = std::thread::spawn(move || {
        lock::acquire(&contender_path, Duration::from_secs(10), None).is_ok()
    });
    std::thread::sleep(Duration::from_millis(50));
    drop(guard);
    assert!(contender.join().unwrap());
    // Fully released at the end.
    assert!(!path.exists());
}
