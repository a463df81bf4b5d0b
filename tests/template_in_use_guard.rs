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
fn recorded_scores_freeze_the_component_set() {
    let workspace = temp_dir("schoolbook-template-in-use");
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
        json!({ "name": "Hillcrest High" }),
    );
    let school_id = str_field(&school, "schoolId");
    let user = request_ok(
        &mut stdin,
        &mut reader,
        "users.create",
        json!({ "schoolId": school_id, "displayName": "Vice Principal" }),
    );
    let user_id = str_field(&user, "userId");
    let session = request_ok(
        &mut stdin,
        &mut reader,
        "sessions.create",
        json!({ "userId": user_id, "name": "2024/2025", "makeCurrent": true }),
    );
    let session_id = str_field(&session, "sessionId");
    let term = request_ok(
        &mut stdin,
        &mut reader,
        "terms.create",
        json!({ "userId": user_id, "sessionId": session_id, "name": "First Term", "makeCurrent": true }),
    );
    let term_id = str_field(&term, "termId");
    let level = request_ok(
        &mut stdin,
        &mut reader,
        "levels.create",
        json!({ "userId": user_id, "name": "JSS2" }),
    );
    let level_id = str_field(&level, "levelId");
    let arm = request_ok(
        &mut stdin,
        &mut reader,
        "classArms.create",
        json!({ "userId": user_id, "sessionId": session_id, "levelId": level_id, "name": "B" }),
    );
    let class_arm_id = str_field(&arm, "classArmId");
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "subjects.create",
        json!({ "userId": user_id, "name": "English" }),
    );
    let subject_id = str_field(&subject, "subjectId");
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "students.create",
        json!({ "userId": user_id, "lastName": "Bello", "firstName": "Amina" }),
    );
    let student_id = str_field(&student, "studentId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "enrollments.create",
        json!({ "userId": user_id, "studentId": student_id, "classArmId": class_arm_id }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "templates.create",
        json!({
            "userId": user_id, "sessionId": session_id, "name": "Junior Rubric",
            "components": [
                { "name": "CA", "maxScore": 40 },
                { "name": "Exam", "maxScore": 60, "isExam": true }
            ]
        }),
    );
    let template_id = str_field(&created, "templateId");

    // Before any score lands, the component set may still change.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "templates.update",
        json!({
            "userId": user_id, "templateId": template_id,
            "components": [
                { "name": "Test1", "maxScore": 20 },
                { "name": "Test2", "maxScore": 20 },
                { "name": "Exam", "maxScore": 60, "isExam": true }
            ]
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "scores.record",
        json!({
            "userId": user_id, "studentId": student_id, "subjectId": subject_id,
            "termId": term_id, "name": "Test1", "score": 15
        }),
    );

    let frozen = request_err(
        &mut stdin,
        &mut reader,
        "templates.update",
        json!({
            "userId": user_id, "templateId": template_id,
            "components": [
                { "name": "CA", "maxScore": 40 },
                { "name": "Exam", "maxScore": 60, "isExam": true }
            ]
        }),
    );
    assert_eq!(frozen.get("code").and_then(|v| v.as_str()), Some("conflict"));

    // Renames stay allowed; only the component set is frozen.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "templates.update",
        json!({ "userId": user_id, "templateId": template_id, "name": "Junior Rubric v2" }),
    );

    let deletion = request_err(
        &mut stdin,
        &mut reader,
        "templates.delete",
        json!({ "userId": user_id, "templateId": template_id }),
    );
    assert_eq!(deletion.get("code").and_then(|v| v.as_str()), Some("conflict"));
}
