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
fn mid_batch_failure_rolls_back_the_whole_cohort() {
    let workspace = temp_dir("schoolbook-promotion-atomicity");
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
        json!({ "name": "Anchor Academy" }),
    );
    let school_id = str_field(&school, "schoolId");
    let user = request_ok(
        &mut stdin,
        &mut reader,
        "users.create",
        json!({ "schoolId": school_id, "displayName": "Registrar" }),
    );
    let user_id = str_field(&user, "userId");

    let current = request_ok(
        &mut stdin,
        &mut reader,
        "sessions.create",
        json!({ "userId": user_id, "name": "2024/2025", "makeCurrent": true }),
    );
    let current_session_id = str_field(&current, "sessionId");
    let next = request_ok(
        &mut stdin,
        &mut reader,
        "sessions.create",
        json!({ "userId": user_id, "name": "2025/2026" }),
    );
    let next_session_id = str_field(&next, "sessionId");

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

    let source = request_ok(
        &mut stdin,
        &mut reader,
        "classArms.create",
        json!({
            "userId": user_id, "sessionId": current_session_id,
            "levelId": jss1_id, "name": "JSS1-A"
        }),
    );
    let source_arm_id = str_field(&source, "classArmId");

    let mut student_ids: Vec<String> = Vec::new();
    for (last, first) in [("Umar", "Bashir"), ("Okon", "Grace"), ("Lawal", "Kunle")] {
        let student = request_ok(
            &mut stdin,
            &mut reader,
            "students.create",
            json!({ "userId": user_id, "lastName": last, "firstName": first }),
        );
        let student_id = str_field(&student, "studentId");
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            "enrollments.create",
            json!({ "userId": user_id, "studentId": student_id, "classArmId": source_arm_id }),
        );
        student_ids.push(student_id);
    }

    // The roster is processed in name order; Okon sits mid-batch and is no
    // longer promotable.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "students.setStatus",
        json!({ "userId": user_id, "studentId": student_ids[1], "status": "INACTIVE" }),
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "promotions.promoteClassArm",
        json!({
            "userId": user_id,
            "sourceClassArmId": source_arm_id,
            "targetSessionId": next_session_id,
            "promotionType": "PROMOTE"
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    // Nothing moved: every student still has exactly their source enrollment.
    for student_id in &student_ids {
        let list = request_ok(
            &mut stdin,
            &mut reader,
            "enrollments.list",
            json!({ "userId": user_id, "studentId": student_id }),
        );
        let rows = list.get("enrollments").and_then(|v| v.as_array()).expect("rows");
        assert_eq!(rows.len(), 1, "no new enrollment rows: {}", list);
        assert_eq!(rows[0].get("isActive").and_then(|v| v.as_bool()), Some(true));
        assert_eq!(
            rows[0].get("classArmId").and_then(|v| v.as_str()),
            Some(source_arm_id.as_str())
        );
        assert!(rows[0].get("leftAt").map(|v| v.is_null()).unwrap_or(false));
    }

    // The target arm creation rolled back with the rest of the batch.
    let arms = request_ok(
        &mut stdin,
        &mut reader,
        "classArms.list",
        json!({ "userId": user_id, "sessionId": next_session_id }),
    );
    assert_eq!(
        arms.get("classArms").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let history = request_ok(
        &mut stdin,
        &mut reader,
        "promotions.history",
        json!({ "userId": user_id }),
    );
    assert_eq!(
        history
            .get("promotions")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );
}
