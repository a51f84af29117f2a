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
use std::path::PathBuf;
use std::sync::Arc;

use datalad_lib::resultbus::ResultStatus;
use datalad_lib::runner::CancelToken;
use datalad_lib::transfer::Candidate;
use datalad_lib::transfer::ContentSink;
use datalad_lib::transfer::DirSink;
use datalad_lib::transfer::EngineOptions;
use datalad_lib::transfer::LocalCloneSource;
use datalad_lib::transfer::TransferEngine;
use datalad_lib::transfer::TransferTask;
use testutils::StaticSource;
use testutils::key_for;
use testutils::new_temp_dir;

fn engine(sink_dir: PathBuf, jobs: usize, retries: u32) -> (TransferEngine, CancelToken) {
    let options = EngineOptions {
        jobs,
        retries,
        cancel: CancelToken::new(),
    };
    let cancel = options.cancel.clone();
    (
        TransferEngine::new(Arc::new(DirSink::new(sink_dir)), options),
        cancel,
    )
}

/// Candidate ordering across source variants: the cheapest cost prefix is
/// tried first, throttling falls through to the next variant, and the
/// most expensive one is never touched.
#[test]
fn test_variant_ordering_and_fallback() {
    let dir = new_temp_dir();
    let content = b"variant payload";
    let s3 = StaticSource::flaky("010-s3", 10, content, usize::MAX);
    let ora = StaticSource::new("050-ora", 50, content);
    let http = StaticSource::new("100-http", 100, content);

    let (engine, _cancel) = engine(dir.path().join("sink"), 2, 0);
    let records = engine.run(
        vec![TransferTask {
            key: key_for("k", content),
            path: dir.path().join("k"),
            candidates: vec![http.candidate(), s3.candidate(), ora.candidate()],
        }],
        |_| {},
    );
    assert_eq!(records[0].status, ResultStatus::Ok);
    assert_eq!(
        records[0].extra.get("source").and_then(|v| v.as_str()),
        Some("050-ora")
    );
    assert_eq!(s3.fetch_count(), 1);
    assert_eq!(ora.fetch_count(), 1);
    assert_eq!(http.fetch_count(), 0);
}

/// The push/fetch round-trip law, at the content level: bytes that went
/// into one store can be cloned out of it and match the original.
#[test]
fn test_clone_round_trip_preserves_content() {
    let dir = new_temp_dir();
    let content = b"round trip payload";
    let key = key_for("rt", content);

    // First hop: a source fills the "origin" store.
    let origin = dir.path().join("origin");
    let (first, _cancel) = engine(origin.clone(), 1, 0);
    let source = StaticSource::new("100-up", 100, content);
    let records = first.run(
        vec![TransferTask {
            key: key.clone(),
            path: dir.path().join("f"),
            candidates: vec![source.candidate()],
        }],
        |_| {},
    );
    assert_eq!(records[0].status, ResultStatus::Ok);

    // Second hop: a clone obtains the same key from the origin store.
    let clone_sink = dir.path().join("clone");
    let (second, _cancel) = engine(clone_sink.clone(), 1, 0);
    let records = second.run(
        vec![TransferTask {
            key: key.clone(),
            path: dir.path().join("f"),
            candidates: vec![Candidate {
                label: "200-origin".into(),
                cost: 200,
                source: Arc::new(LocalCloneSource {
                    root: origin,
                    cost: 200,
                }),
            }],
        }],
        |_| {},
    );
    assert_eq!(records[0].status, ResultStatus::Ok);
    assert_eq!(
        fs::read(clone_sink.join(key.as_str())).unwrap(),
        content
    );
}

/// Retries are bounded; once exhausted the task fails with an error
/// record rather than looping.
#[test]
fn test_bounded_retries() {
    let dir = new_temp_dir();
    let content = b"x";
    let flaky = StaticSource::flaky("100-flaky", 100, content, usize::MAX);
    let (engine, _cancel) = engine(dir.path().join("sink"), 1, 2);
    let records = engine.run(
        vec![TransferTask {
            key: key_for("k", content),
            path: dir.path().join("k"),
            candidates: vec![flaky.candidate()],
        }],
        |_| {},
    );
    assert_eq!(records[0].status, ResultStatus::Error);
    // One initial sweep plus two retries.
    assert_eq!(flaky.fetch_count(), 3);
}

/// A tripped token fails every not-yet-finished task and leaves the
/// staging area clean.
#[test]
fn test_cancellation_leaves_clean_state() {
    let dir = new_temp_dir();
    let sink_dir = dir.path().join("sink");
    let content = b"cancellable";
    let (engine, cancel) = engine(sink_dir.clone(), 2, 0);

    let fast = StaticSource::new("100-fast", 100, content);
    let mut tasks = vec![TransferTask {
        key: key_for("fast", content),
        path: dir.path().join("fast"),
        candidates: vec![fast.candidate()],
    }];
    cancel.cancel();
    for i in 0..6 {
        let source = StaticSource::new(&format!("100-late-{i}"), 100, content);
        tasks.push(TransferTask {
            key: key_for(&format!("late{i}"), content),
            path: dir.path().join(format!("late{i}")),
            candidates: vec![source.candidate()],
        });
    }
    let records = engine.run(tasks, |_| {});
    assert_eq!(records.len(), 7);
    assert!(
        records
            .iter()
            .all(|record| record.status == ResultStatus::Error),
        "cancellation before start fails every task"
    );
    let sink = DirSink::new(&sink_dir);
    assert!(!sink.has(&key_for("late0", content)));
    let staging = sink_dir.join("transfer");
    let leftovers = fs::read_dir(&staging)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0, "partial files must not remain");
}
