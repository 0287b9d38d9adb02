mod test_support;

use serde_json::{json, Value};
use test_support::{error_code, request, request_ok, select_small_week, spawn_sidecar, temp_dir};

fn id_of(res: &Value, key: &str) -> String {
    res[key].as_str().expect(key).to_string()
}

#[test]
fn catalogue_crud_keeps_cached_names_in_step() {
    let workspace = temp_dir("timetabled-catalog");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy(), "schoolId": "north" }),
    );

    let blank = request(&mut stdin, &mut reader, "2", "subjects.create", json!({ "name": "  " }));
    assert_eq!(error_code(&blank), Some("bad_params"));

    let bio = id_of(
        &request_ok(
            &mut stdin,
            &mut reader,
            "3",
            "subjects.create",
            json!({ "name": "Biology", "localizedName": "Biologie" }),
        ),
        "subjectId",
    );
    let teacher = id_of(
        &request_ok(&mut stdin, &mut reader, "4", "teachers.create", json!({ "name": "Olu" })),
        "teacherId",
    );
    let class_id = id_of(
        &request_ok(
            &mut stdin,
            &mut reader,
            "5",
            "classes.create",
            json!({ "name": "10", "section": "B", "classTeacherId": teacher }),
        ),
        "classId",
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "timetable.cellUpsert",
        json!({ "classId": class_id, "day": "Monday", "periodId": 2, "subjectId": bio, "teacherId": teacher }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "subjects.update",
        json!({ "subjectId": bio, "name": "Life Science" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "teachers.update",
        json!({ "teacherId": teacher, "name": "Olu A." }),
    );
    let opened = request_ok(&mut stdin, &mut reader, "9", "timetable.open", json!({ "classId": class_id }));
    let cell = &opened["grid"]["Monday"]["2"];
    assert_eq!(cell["subjectName"].as_str(), Some("Life Science"));
    assert_eq!(cell["teacherName"].as_str(), Some("Olu A."));

    let subjects = request_ok(&mut stdin, &mut reader, "10", "subjects.list", json!({}));
    let listed = &subjects["subjects"][0];
    assert_eq!(listed["name"].as_str(), Some("Life Science"));
    assert_eq!(listed["localizedName"].as_str(), Some("Biologie"));

    let classes = request_ok(&mut stdin, &mut reader, "11", "classes.list", json!({}));
    let row = &classes["classes"][0];
    assert_eq!(row["section"].as_str(), Some("B"));
    assert_eq!(row["classTeacherName"].as_str(), Some("Olu A."));
    assert_eq!(row["cellCount"].as_u64(), Some(1));

    // Deleting the teacher leaves the cell unstaffed and clears the homeroom link.
    let _ = request_ok(&mut stdin, &mut reader, "12", "teachers.delete", json!({ "teacherId": teacher }));
    let opened = request_ok(&mut stdin, &mut reader, "13", "timetable.open", json!({ "classId": class_id }));
    assert!(opened["classTeacherId"].is_null());
    assert!(opened["grid"]["Monday"]["2"]["teacherId"].is_null());
    assert_eq!(opened["grid"]["Monday"]["2"]["subjectName"].as_str(), Some("Life Science"));

    let _ = request_ok(&mut stdin, &mut reader, "14", "classes.delete", json!({ "classId": class_id }));
    let missing = request(&mut stdin, &mut reader, "15", "timetable.open", json!({ "classId": class_id }));
    assert_eq!(error_code(&missing), Some("not_found"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn deleting_a_homeroom_teacher_leaves_homeroom_not_assigned() {
    let workspace = temp_dir("timetabled-homeroom-delete");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_small_week(&mut stdin, &mut reader, &workspace, &["Monday", "Tuesday"]);

    let _ = request_ok(&mut stdin, &mut reader, "1", "subjects.create", json!({ "name": "Art" }));
    let homeroom = id_of(
        &request_ok(&mut stdin, &mut reader, "2", "teachers.create", json!({ "name": "Ines" })),
        "teacherId",
    );
    let class_id = id_of(
        &request_ok(
            &mut stdin,
            &mut reader,
            "3",
            "classes.create",
            json!({ "name": "4", "classTeacherId": homeroom }),
        ),
        "classId",
    );
    let generated = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "timetable.generate",
        json!({ "classId": class_id }),
    );
    assert_eq!(
        generated["grid"]["Monday"]["1"]["teacherId"].as_str(),
        Some(homeroom.as_str())
    );

    let _ = request_ok(&mut stdin, &mut reader, "5", "teachers.delete", json!({ "teacherId": homeroom }));
    let opened = request_ok(&mut stdin, &mut reader, "6", "timetable.open", json!({ "classId": class_id }));
    for day in ["Monday", "Tuesday"] {
        let p1 = &opened["grid"][day]["1"];
        assert_eq!(p1["subjectName"].as_str(), Some("Homeroom"), "{}", day);
        assert!(p1["teacherId"].is_null(), "{}", day);
        assert_eq!(p1["teacherName"].as_str(), Some("Not Assigned"), "{}", day);
        // Taught periods lose the name outright.
        let p2 = &opened["grid"][day]["2"];
        assert!(p2["teacherId"].is_null(), "{}", day);
        assert!(p2["teacherName"].is_null(), "{}", day);
    }

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn schools_in_one_workspace_are_isolated() {
    let workspace = temp_dir("timetabled-tenants");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy(), "schoolId": "north" }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "2", "teachers.create", json!({ "name": "Pia" }));

    let health = request_ok(&mut stdin, &mut reader, "3", "health", json!({}));
    assert_eq!(health["schoolId"].as_str(), Some("north"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy(), "schoolId": "south" }),
    );
    let south = request_ok(&mut stdin, &mut reader, "5", "teachers.list", json!({}));
    assert!(south["teachers"].as_array().expect("teachers").is_empty());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy(), "schoolId": "north" }),
    );
    let north = request_ok(&mut stdin, &mut reader, "7", "teachers.list", json!({}));
    assert_eq!(north["teachers"].as_array().expect("teachers").len(), 1);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn class_subject_lists_and_allocations() {
    let workspace = temp_dir("timetabled-class-subjects");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let chem = id_of(
        &request_ok(&mut stdin, &mut reader, "2", "subjects.create", json!({ "name": "Chemistry" })),
        "subjectId",
    );
    let hist = id_of(
        &request_ok(&mut stdin, &mut reader, "3", "subjects.create", json!({ "name": "History" })),
        "subjectId",
    );
    let teacher = id_of(
        &request_ok(&mut stdin, &mut reader, "4", "teachers.create", json!({ "name": "Quinn" })),
        "teacherId",
    );
    let class_id = id_of(
        &request_ok(&mut stdin, &mut reader, "5", "classes.create", json!({ "name": "11" })),
        "classId",
    );

    let all = request_ok(&mut stdin, &mut reader, "6", "classes.subjects", json!({ "classId": class_id }));
    assert_eq!(all["usesCatalogue"].as_bool(), Some(true));
    assert_eq!(all["subjects"].as_array().expect("subjects").len(), 2);

    let bad = request(
        &mut stdin,
        &mut reader,
        "7",
        "classes.setSubjects",
        json!({ "classId": class_id, "subjects": [{ "subjectId": hist, "periodsPerWeek": 0 }] }),
    );
    assert_eq!(error_code(&bad), Some("bad_params"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "classes.setSubjects",
        json!({ "classId": class_id, "subjects": [{ "subjectId": hist, "periodsPerWeek": 4 }] }),
    );
    let own = request_ok(&mut stdin, &mut reader, "9", "classes.subjects", json!({ "classId": class_id }));
    assert_eq!(own["usesCatalogue"].as_bool(), Some(false));
    assert_eq!(own["subjects"][0]["id"].as_str(), Some(hist.as_str()));
    assert_eq!(own["subjects"][0]["periodsPerWeek"].as_u64(), Some(4));

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "allocations.create",
        json!({ "teacherId": teacher, "classId": class_id, "subjectId": chem }),
    );
    assert_eq!(created["created"].as_bool(), Some(true));
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "allocations.create",
        json!({ "teacherId": teacher, "classId": class_id, "subjectId": chem }),
    );
    assert_eq!(again["created"].as_bool(), Some(false));
    assert_eq!(again["allocationId"], created["allocationId"]);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "allocations.list",
        json!({ "teacherId": teacher }),
    );
    let rows = listed["allocations"].as_array().expect("allocations");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["subjectName"].as_str(), Some("Chemistry"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "allocations.delete",
        json!({ "allocationId": created["allocationId"] }),
    );
    let listed = request_ok(&mut stdin, &mut reader, "14", "allocations.list", json!({}));
    assert!(listed["allocations"].as_array().expect("allocations").is_empty());

    // An empty list reverts the class to the whole catalogue.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "classes.setSubjects",
        json!({ "classId": class_id, "subjects": [] }),
    );
    let reverted = request_ok(&mut stdin, &mut reader, "16", "classes.subjects", json!({ "classId": class_id }));
    assert_eq!(reverted["usesCatalogue"].as_bool(), Some(true));

    let _ = std::fs::remove_dir_all(workspace);
}
