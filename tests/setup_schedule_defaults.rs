mod test_support;

use serde_json::json;
use test_support::{error_code, request, request_ok, spawn_sidecar, temp_dir};

#[test]
fn schedule_defaults_lay_out_a_standard_day() {
    let workspace = temp_dir("timetabled-setup-defaults");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let setup = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    let schedule = &setup["schedule"];
    assert_eq!(schedule["startTime"].as_str(), Some("08:00"));
    assert_eq!(schedule["periodsPerDay"].as_u64(), Some(8));
    assert_eq!(schedule["periodMinutes"].as_u64(), Some(40));
    assert_eq!(schedule["homeroomMinutes"].as_u64(), Some(50));
    assert_eq!(
        schedule["workingDays"],
        json!(["Monday", "Tuesday", "Wednesday", "Thursday", "Friday"])
    );
    assert_eq!(setup["generator"]["subjectOrder"].as_str(), Some("balanced"));

    let periods = request_ok(&mut stdin, &mut reader, "3", "schedule.periods", json!({}));
    let slots = periods["slots"].as_array().expect("slots");
    // 8 periods plus a break after 3 and lunch after 5.
    assert_eq!(slots.len(), 10);
    assert_eq!(slots[0]["kind"].as_str(), Some("teaching"));
    assert_eq!(slots[0]["periodId"].as_u64(), Some(1));
    assert_eq!(slots[0]["start"].as_str(), Some("08:00"));
    assert_eq!(slots[0]["end"].as_str(), Some("08:50"));
    assert_eq!(slots[3]["kind"].as_str(), Some("break"));
    assert!(slots[3]["periodId"].is_null());
    assert_eq!(slots[3]["start"].as_str(), Some("10:10"));
    assert_eq!(slots[6]["kind"].as_str(), Some("lunch"));
    assert_eq!(slots[9]["periodId"].as_u64(), Some(8));
    assert_eq!(slots[9]["end"].as_str(), Some("14:15"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn schedule_updates_persist_and_reject_bad_layouts() {
    let workspace = temp_dir("timetabled-setup-update");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "setup.update",
        json!({
            "section": "schedule",
            "patch": {
                "startTime": "07:30",
                "periodsPerDay": 6,
                "lunchAfterPeriod": 4,
                "workingDays": ["sat", "Monday", "wed"]
            }
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({ "section": "generator", "patch": { "subjectOrder": "Shuffle" } }),
    );

    let setup = request_ok(&mut stdin, &mut reader, "4", "setup.get", json!({}));
    assert_eq!(setup["schedule"]["startTime"].as_str(), Some("07:30"));
    assert_eq!(setup["schedule"]["periodsPerDay"].as_u64(), Some(6));
    assert_eq!(
        setup["schedule"]["workingDays"],
        json!(["Monday", "Wednesday", "Saturday"])
    );
    assert_eq!(setup["generator"]["subjectOrder"].as_str(), Some("shuffle"));

    let bad_patches = [
        json!({ "section": "schedule", "patch": { "startTime": "7am" } }),
        json!({ "section": "schedule", "patch": { "periodsPerDay": 0 } }),
        json!({ "section": "schedule", "patch": { "workingDays": [] } }),
        json!({ "section": "schedule", "patch": { "workingDays": ["Monday", "mon"] } }),
        json!({ "section": "schedule", "patch": { "workingDays": ["Sunday"] } }),
        json!({ "section": "schedule", "patch": { "bellTone": 3 } }),
        // Individually valid, but lunch would follow a period that no longer exists.
        json!({ "section": "schedule", "patch": { "periodsPerDay": 3 } }),
        json!({ "section": "schedule", "patch": { "startTime": "23:00" } }),
        json!({ "section": "generator", "patch": { "subjectOrder": "random" } }),
        json!({ "section": "reports", "patch": {} }),
    ];
    for (i, params) in bad_patches.into_iter().enumerate() {
        let resp = request(&mut stdin, &mut reader, &format!("bad{}", i), "setup.update", params);
        assert_eq!(error_code(&resp), Some("bad_params"), "case {}: {}", i, resp);
    }

    // Rejected patches leave the saved section alone.
    let setup = request_ok(&mut stdin, &mut reader, "5", "setup.get", json!({}));
    assert_eq!(setup["schedule"]["periodsPerDay"].as_u64(), Some(6));

    let periods = request_ok(&mut stdin, &mut reader, "6", "schedule.periods", json!({}));
    let teaching: Vec<u64> = periods["slots"]
        .as_array()
        .expect("slots")
        .iter()
        .filter(|s| s["kind"].as_str() == Some("teaching"))
        .filter_map(|s| s["periodId"].as_u64())
        .collect();
    assert_eq!(teaching, vec![1, 2, 3, 4, 5, 6]);

    let _ = std::fs::remove_dir_all(workspace);
}
