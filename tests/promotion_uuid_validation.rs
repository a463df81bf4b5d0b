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

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().expect("error object")
}

fn str_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, value))
        .to_string()
}

#[test]
fn malformed_optional_arm_ids_fail_before_any_lookup() {
    let workspace = temp_dir("schoolbook-uuid-validation");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = request_ok(
        &mut stdin,
        &mut reader,
        "schools.create",
        json!({ "name": "Cedar Grove School" }),
    );
    let school_id = str_field(&school, "schoolId");
    let user = request_ok(
        &mut stdin,
        &mut reader,
        "users.create",
        json!({ "schoolId": school_id, "displayName": "Registrar" }),
    );
    let user_id = str_field(&user, "userId");

    // Malformed ids are rejected up front, even though the source arm id
    // itself does not resolve either.
    let garbled = request_err(
        &mut stdin,
        &mut reader,
        "promotions.promoteClassArm",
        json!({
            "userId": user_id,
            "sourceClassArmId": "whatever",
            "targetSessionId": "whatever",
            "promotionType": "PROMOTE",
            "existingTargetClassArmId": "not-a-uuid"
        }),
    );
    assert_eq!(garbled.get("code").and_then(|v| v.as_str()), Some("bad_params"));
    assert!(garbled
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .contains("UUID"));

    // The nil UUID parses but is no version 1-5.
    let nil = request_err(
        &mut stdin,
        &mut reader,
        "promotions.promoteClassArm",
        json!({
            "userId": user_id,
            "sourceClassArmId": "whatever",
            "targetSessionId": "whatever",
            "promotionType": "PROMOTE",
            "repeatersClassArmId": "00000000-0000-0000-0000-000000000000"
        }),
    );
    assert_eq!(nil.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    // A well-formed v4 id gets past validation and fails on existence instead.
    let session = request_ok(
        &mut stdin,
        &mut reader,
        "sessions.create",
        json!({ "userId": user_id, "name": "2024/2025", "makeCurrent": true }),
    );
    let session_id = str_field(&session, "sessionId");
    let next_session = request_ok(
        &mut stdin,
        &mut reader,
        "sessions.create",
        json!({ "userId": user_id, "name": "2025/2026" }),
    );
    let next_session_id = str_field(&next_session, "sessionId");
    let jss1 = request_ok(
        &mut stdin,
        &mut reader,
        "levels.create",
        json!({ "userId": user_id, "name": "JSS1" }),
    );
    let jss1_id = str_field(&jss1, "levelId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "levels.create",
        json!({ "userId": user_id, "name": "JSS2" }),
    );
    let arm = request_ok(
        &mut stdin,
        &mut reader,
        "classArms.create",
        json!({ "userId": user_id, "sessionId": session_id, "levelId": jss1_id, "name": "A" }),
    );
    let arm_id = str_field(&arm, "classArmId");
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "students.create",
        json!({ "userId": user_id, "lastName": "Ojo", "firstName": "Bisi" }),
    );
    let student_id = str_field(&student, "studentId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "enrollments.create",
        json!({ "userId": user_id, "studentId": student_id, "classArmId": arm_id }),
    );

    let unknown_arm = request_err(
        &mut stdin,
        &mut reader,
        "promotions.promoteClassArm",
        json!({
            "userId": user_id,
            "sourceClassArmId": arm_id,
            "targetSessionId": next_session_id,
            "promotionType": "PROMOTE",
            "useExistingClassArm": true,
            "existingTargetClassArmId": "7f6c1556-22a4-4f4a-9c4e-3a8f4d2b9e10"
        }),
    );
    assert_eq!(unknown_arm.get("code").and_then(|v| v.as_str()), Some("not_found"));
}
