use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoolbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoolbookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let id = NEXT_ID.fetch_add(1, Ordering::SeqCst).to_string();
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn str_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, value))
        .to_string()
}

struct Tenant {
    user_id: String,
    session_id: String,
    level_id: String,
}

fn bootstrap(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
    school_name: &str,
) -> Tenant {
    let _ = request_ok(
        stdin,
        reader,
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = request_ok(stdin, reader, "schools.create", json!({ "name": school_name }));
    let school_id = str_field(&school, "schoolId");
    let user = request_ok(
        stdin,
        reader,
        "users.create",
        json!({ "schoolId": school_id, "displayName": "Registrar" }),
    );
    let user_id = str_field(&user, "userId");
    let session = request_ok(
        stdin,
        reader,
        "sessions.create",
        json!({ "userId": user_id, "name": "2024/2025", "makeCurrent": true }),
    );
    let session_id = str_field(&session, "sessionId");
    let level = request_ok(
        stdin,
        reader,
        "levels.create",
        json!({ "userId": user_id, "name": "JSS1" }),
    );
    let level_id = str_field(&level, "levelId");
    Tenant {
        user_id,
        session_id,
        level_id,
    }
}

#[test]
fn one_active_enrollment_per_session() {
    let workspace = temp_dir("schoolbook-enrollment-exclusivity");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let tenant = bootstrap(&mut stdin, &mut reader, &workspace, "Beacon House School");

    let arm_a = request_ok(
        &mut stdin,
        &mut reader,
        "classArms.create",
        json!({
            "userId": tenant.user_id, "sessionId": tenant.session_id,
            "levelId": tenant.level_id, "name": "A"
        }),
    );
    let arm_a_id = str_field(&arm_a, "classArmId");
    let arm_b = request_ok(
        &mut stdin,
        &mut reader,
        "classArms.create",
        json!({
            "userId": tenant.user_id, "sessionId": tenant.session_id,
            "levelId": tenant.level_id, "name": "B"
        }),
    );
    let arm_b_id = str_field(&arm_b, "classArmId");

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "students.create",
        json!({ "userId": tenant.user_id, "lastName": "Danladi", "firstName": "Musa" }),
    );
    let student_id = str_field(&student, "studentId");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "enrollments.create",
        json!({ "userId": tenant.user_id, "studentId": student_id, "classArmId": arm_a_id }),
    );
    // A transfer within the session deactivates the first row.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "enrollments.create",
        json!({ "userId": tenant.user_id, "studentId": student_id, "classArmId": arm_b_id }),
    );

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "enrollments.list",
        json!({ "userId": tenant.user_id, "studentId": student_id }),
    );
    let rows = list.get("enrollments").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 2);
    let active: Vec<&serde_json::Value> = rows
        .iter()
        .filter(|r| r.get("isActive").and_then(|v| v.as_bool()) == Some(true))
        .collect();
    assert_eq!(active.len(), 1, "exactly one active row: {}", list);
    assert_eq!(
        active[0].get("classArmId").and_then(|v| v.as_str()),
        Some(arm_b_id.as_str())
    );
    let inactive = rows
        .iter()
        .find(|r| r.get("isActive").and_then(|v| v.as_bool()) == Some(false))
        .expect("inactive row");
    assert!(inactive.get("leftAt").and_then(|v| v.as_str()).is_some());
}

#[test]
fn single_student_promotion_transfers_the_enrollment() {
    let workspace = temp_dir("schoolbook-single-promotion");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let tenant = bootstrap(&mut stdin, &mut reader, &workspace, "Crown Heights College");

    let next_session = request_ok(
        &mut stdin,
        &mut reader,
        "sessions.create",
        json!({ "userId": tenant.user_id, "name": "2025/2026" }),
    );
    let next_session_id = str_field(&next_session, "sessionId");
    let jss2 = request_ok(
        &mut stdin,
        &mut reader,
        "levels.create",
        json!({ "userId": tenant.user_id, "name": "JSS2" }),
    );
    let jss2_id = str_field(&jss2, "levelId");

    let source_arm = request_ok(
        &mut stdin,
        &mut reader,
        "classArms.create",
        json!({
            "userId": tenant.user_id, "sessionId": tenant.session_id,
            "levelId": tenant.level_id, "name": "A"
        }),
    );
    let source_arm_id = str_field(&source_arm, "classArmId");
    let target_arm = request_ok(
        &mut stdin,
        &mut reader,
        "classArms.create",
        json!({
            "userId": tenant.user_id, "sessionId": next_session_id,
            "levelId": jss2_id, "name": "A"
        }),
    );
    let target_arm_id = str_field(&target_arm, "classArmId");

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "students.create",
        json!({ "userId": tenant.user_id, "lastName": "Afolabi", "firstName": "Seun" }),
    );
    let student_id = str_field(&student, "studentId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "enrollments.create",
        json!({ "userId": tenant.user_id, "studentId": student_id, "classArmId": source_arm_id }),
    );

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "promotions.promoteStudent",
        json!({
            "userId": tenant.user_id,
            "studentId": student_id,
            "targetClassArmId": target_arm_id
        }),
    );
    // The result echoes names, not enrollment row ids.
    assert_eq!(result.get("fromClassArm").and_then(|v| v.as_str()), Some("A"));
    assert_eq!(result.get("toClassArm").and_then(|v| v.as_str()), Some("A"));
    assert_eq!(result.get("fromLevel").and_then(|v| v.as_str()), Some("JSS1"));
    assert_eq!(result.get("toLevel").and_then(|v| v.as_str()), Some("JSS2"));
    assert_eq!(
        result.get("academicSession").and_then(|v| v.as_str()),
        Some("2025/2026")
    );

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "enrollments.list",
        json!({ "userId": tenant.user_id, "studentId": student_id }),
    );
    let rows = list.get("enrollments").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 2);
    let active: Vec<&serde_json::Value> = rows
        .iter()
        .filter(|r| r.get("isActive").and_then(|v| v.as_bool()) == Some(true))
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(
        active[0].get("classArmId").and_then(|v| v.as_str()),
        Some(target_arm_id.as_str())
    );
    assert_eq!(
        active[0].get("sessionId").and_then(|v| v.as_str()),
        Some(next_session_id.as_str())
    );

    let history = request_ok(
        &mut stdin,
        &mut reader,
        "promotions.history",
        json!({ "userId": tenant.user_id, "studentId": student_id }),
    );
    let ledger = history
        .get("promotions")
        .and_then(|v| v.as_array())
        .expect("ledger");
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].get("promotionType").and_then(|v| v.as_str()), Some("MANUAL"));
}

#[test]
fn capacity_overage_is_a_warning_not_an_error() {
    let workspace = temp_dir("schoolbook-capacity-warning");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let tenant = bootstrap(&mut stdin, &mut reader, &workspace, "Federal Model College");

    let arm = request_ok(
        &mut stdin,
        &mut reader,
        "classArms.create",
        json!({
            "userId": tenant.user_id, "sessionId": tenant.session_id,
            "levelId": tenant.level_id, "name": "A"
        }),
    );
    let arm_id = str_field(&arm, "classArmId");

    // Fill the arm to its fixed capacity of 30.
    for i in 0..30 {
        let student = request_ok(
            &mut stdin,
            &mut reader,
            "students.create",
            json!({ "userId": tenant.user_id, "lastName": format!("Student{:02}", i), "firstName": "Test" }),
        );
        let student_id = str_field(&student, "studentId");
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            "enrollments.create",
            json!({ "userId": tenant.user_id, "studentId": student_id, "classArmId": arm_id }),
        );
    }

    let extra = request_ok(
        &mut stdin,
        &mut reader,
        "students.create",
        json!({ "userId": tenant.user_id, "lastName": "Overflow", "firstName": "Ada" }),
    );
    let extra_id = str_field(&extra, "studentId");

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "promotions.promoteStudent",
        json!({
            "userId": tenant.user_id,
            "studentId": extra_id,
            "targetClassArmId": arm_id
        }),
    );
    let warnings = result
        .get("warnings")
        .and_then(|v| v.as_array())
        .expect("warnings");
    assert_eq!(warnings.len(), 1, "capacity warning expected: {}", result);
    assert!(warnings[0]
        .as_str()
        .unwrap_or("")
        .contains("capacity"));

    // The placement still happened; first-time placement has no prior row.
    let list = request_ok(
        &mut stdin,
        &mut reader,
        "enrollments.list",
        json!({ "userId": tenant.user_id, "studentId": extra_id }),
    );
    let rows = list.get("enrollments").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("isActive").and_then(|v| v.as_bool()), Some(true));
}
