//! Realistic workloads: list merging, CSV files and user record types.

mod common;

use common::*;
use lambdai::prelude::*;
use serde_json::json;
use std::fs;

#[tokio::test]
async fn test_merge_and_sort_regenerates_nested_candidate() {
    let backend = MockBackend::new(vec![answer(merge_nested()), answer(merge_sorted())]);
    let (engine, _) = engine(backend.clone());
    let session = engine.session("demo");

    let merged = session
        .call("merge {a} and {b}, sort the result")
        .arg(json!([["123"]]))
        .arg(json!([["456"]]))
        .shape(shape!("list[str]"))
        .oracle(|f: &Callable| {
            f.call(&[json!([["b"]]), json!([["a"]])]).ok() == Some(json!(["a", "b"]))
        })
        .await
        .unwrap();
    assert_eq!(merged, json!(["123", "456"]));
    assert_eq!(backend.calls(), 2);

    // Same shapes, new values: served from cache
    let again = session
        .call("merge {a} and {b}, sort the result")
        .arg(json!([["9"], ["10"]]))
        .arg(json!([["1"]]))
        .shape(shape!("list[str]"))
        .await
        .unwrap();
    assert_eq!(again, json!(["1", "10", "9"]));
    assert_eq!(backend.calls(), 2);
}

fn parse_csv_program() -> serde_json::Value {
    // [header, rows]
    json!({"name": "parse_csv", "params": ["path"], "body": {
        "let": {"table": {"op": "read_csv", "args": [{"var": "path"}]}},
        "in": [
            {"op": "first", "args": [{"var": "table"}]},
            {"op": "slice", "args": [{"var": "table"}, 1]}
        ]
    }})
}

#[tokio::test]
async fn test_csv_parsing_reuses_implementation_across_paths() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("1.csv");
    let second = dir.path().join("2.csv");
    fs::write(&first, "身份证号,姓名,年龄\n001,张三,20\n002,李四,21\n").unwrap();
    fs::write(&second, "身份证号,专业\n001,数学\n").unwrap();

    let backend = MockBackend::always(parse_csv_program());
    let (engine, _) = engine(backend.clone());
    let session = engine.session("csv");
    let template = "parse csv file {fname}, return header, rows. Header is a list";
    let shape = shape!("tuple[list[str], list[list[str]]]");

    let one = session
        .call(template)
        .arg(first.to_string_lossy().to_string())
        .shape(shape.clone())
        .await
        .unwrap();
    let two = session
        .call(template)
        .arg(second.to_string_lossy().to_string())
        .shape(shape)
        .await
        .unwrap();

    assert_eq!(one[0], json!(["身份证号", "姓名", "年龄"]));
    assert_eq!(one[1].as_array().unwrap().len(), 2);
    assert_eq!(two, json!([["身份证号", "专业"], [["001", "数学"]]]));
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_missing_file_is_a_validation_failure_not_a_crash() {
    let backend = MockBackend::always(parse_csv_program());
    let (engine, _) = engine(backend.clone());
    let session = engine.session("csv");

    let err = session
        .call("parse csv file {fname}")
        .arg("/definitely/not/here.csv")
        .await
        .unwrap_err();
    match err {
        ExecuteError::SynthesisExhausted { last_failure, .. } => {
            assert_eq!(last_failure.stage, FailureStage::Runtime);
            assert!(last_failure.reason.contains("/definitely/not/here.csv"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_records_are_checked_by_declared_fields() {
    let build_students = json!({"name": "students", "params": ["rows"], "body": {
        "op": "map", "args": [{"var": "rows"}, {"fn": ["r"], "body": {
            "new": "Student",
            "fields": {
                "name": {"op": "get", "args": [{"var": "r"}, 0]},
                "age": {"op": "get", "args": [{"var": "r"}, 1]},
                "gpa": {"op": "get", "args": [{"var": "r"}, 2]}
            }
        }}]
    }});
    let backend = MockBackend::always(build_students);
    let (engine, _) = engine(backend.clone());
    let session = engine.session("school");

    let students = session
        .call("create Student records from {rows}")
        .arg(json!([["张三", 18, 3.8], ["李四", 19, 3.5]]))
        .shape(shape!("list[Student{name: str, age: int, gpa: float}]"))
        .oracle(|f: &Callable| {
            f.call(&[json!([["x", 1, 2.0]])])
                .map(|out| out[0]["__type__"] == json!("Student"))
                .unwrap_or(false)
        })
        .await
        .unwrap();

    assert_eq!(students[1]["name"], json!("李四"));
    assert_eq!(students[0]["age"], json!(18));

    // Sorting the records by a field reuses nothing from the first task
    let by_gpa = json!({"params": ["xs"], "body": {"op": "sort_by", "args": [
        {"var": "xs"}, {"fn": ["s"], "body": {"op": "get", "args": [{"var": "s"}, "gpa"]}}]}});
    let sorter = MockBackend::always(by_gpa);
    let (other_engine, _) = common::engine(sorter.clone());
    let sorted = other_engine
        .session("school")
        .call("sort {students} by gpa")
        .arg(students)
        .shape(shape!("list[Student]"))
        .await
        .unwrap();
    assert_eq!(sorted[0]["name"], json!("李四"));
    assert_eq!(sorter.calls(), 1);
}
