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

#[test]
fn ranking_sorts_descending_with_deterministic_ties() {
    let workspace = temp_dir("schoolbook-ranking");
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
        json!({ "name": "Riverside College" }),
    );
    let school_id = str_field(&school, "schoolId");
    let user = request_ok(
        &mut stdin,
        &mut reader,
        "users.create",
        json!({ "schoolId": school_id, "displayName": "Form Teacher" }),
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
        json!({ "userId": user_id, "name": "JSS3" }),
    );
    let level_id = str_field(&level, "levelId");
    let arm = request_ok(
        &mut stdin,
        &mut reader,
        "classArms.create",
        json!({ "userId": user_id, "sessionId": session_id, "levelId": level_id, "name": "A" }),
    );
    let class_arm_id = str_field(&arm, "classArmId");
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "subjects.create",
        json!({ "userId": user_id, "name": "Mathematics" }),
    );
    let subject_id = str_field(&subject, "subjectId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "templates.create",
        json!({
            "userId": user_id, "sessionId": session_id, "name": "Rubric",
            "components": [
                { "name": "CA", "maxScore": 40 },
                { "name": "Exam", "maxScore": 60, "isExam": true }
            ]
        }),
    );

    let mut student_ids: Vec<String> = Vec::new();
    for (last, first, score) in [
        ("Adeyemi", "Tunde", 80.0),
        ("Ibrahim", "Zainab", 50.0),
        ("Nwosu", "Emeka", 50.0),
    ] {
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
            json!({ "userId": user_id, "studentId": student_id, "classArmId": class_arm_id }),
        );
        // One CA line and one exam line per student, summing to the target.
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            "scores.record",
            json!({
                "userId": user_id, "studentId": student_id, "subjectId": subject_id,
                "termId": term_id, "name": "CA", "score": 20
            }),
        );
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            "scores.record",
            json!({
                "userId": user_id, "studentId": student_id, "subjectId": subject_id,
                "termId": term_id, "name": "Exam", "score": score - 20.0
            }),
        );
        student_ids.push(student_id);
    }

    let ranking = request_ok(
        &mut stdin,
        &mut reader,
        "classArms.ranking",
        json!({ "userId": user_id, "termId": term_id, "classArmId": class_arm_id }),
    );
    assert_eq!(ranking.get("totalStudents").and_then(|v| v.as_u64()), Some(3));
    let entries = ranking
        .get("entries")
        .and_then(|v| v.as_array())
        .expect("entries");
    assert_eq!(entries.len(), 3);

    assert_eq!(
        entries[0].get("studentId").and_then(|v| v.as_str()),
        Some(student_ids[0].as_str()),
        "highest total ranks first"
    );
    assert_eq!(entries[0].get("totalScore").and_then(|v| v.as_f64()), Some(80.0));
    assert_eq!(entries[0].get("rank").and_then(|v| v.as_i64()), Some(1));

    // The two 50-point students settle on ascending student id.
    let mut tied: Vec<String> = student_ids[1..].to_vec();
    tied.sort();
    assert_eq!(
        entries[1].get("studentId").and_then(|v| v.as_str()),
        Some(tied[0].as_str())
    );
    assert_eq!(entries[1].get("rank").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(
        entries[2].get("studentId").and_then(|v| v.as_str()),
        Some(tied[1].as_str())
    );
    assert_eq!(entries[2].get("rank").and_then(|v| v.as_i64()), Some(3));

    // The subject student's position in their own results view agrees.
    let results = request_ok(
        &mut stdin,
        &mut reader,
        "students.results",
        json!({ "userId": user_id, "studentId": student_ids[0] }),
    );
    let overall = results.get("overall").expect("overall");
    assert_eq!(overall.get("position").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(overall.get("totalStudents").and_then(|v| v.as_u64()), Some(3));
}
