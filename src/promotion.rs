use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::db::now_rfc3339;

pub const CLASS_ARM_CAPACITY: i64 = 30;

/// Default level ladder used when a school has not configured progressions.
const LEVEL_LADDER: [&str; 6] = ["JSS1", "JSS2", "JSS3", "SS1", "SS2", "SS3"];

#[derive(Debug, Clone)]
pub struct PromotionError {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl PromotionError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

fn db_err(e: rusqlite::Error) -> PromotionError {
    PromotionError::new("db_query_failed", e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PromotionType {
    Promote,
    Repeat,
}

impl PromotionType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PROMOTE" => Some(Self::Promote),
            "REPEAT" => Some(Self::Repeat),
            _ => None,
        }
    }

    /// Ledger value recorded on the promotion row.
    fn ledger_type(self) -> &'static str {
        match self {
            Self::Promote => "MANUAL",
            Self::Repeat => "REPEAT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromoteStudentRequest {
    pub student_id: String,
    pub target_class_arm_id: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PromoteClassArmRequest {
    pub source_class_arm_id: String,
    pub target_session_id: String,
    pub target_level_id: Option<String>,
    pub promotion_type: PromotionType,
    pub student_ids: Option<Vec<String>>,
    pub use_existing_class_arm: bool,
    pub existing_target_class_arm_id: Option<String>,
    pub target_class_arm_name: Option<String>,
    pub repeaters_class_arm_id: Option<String>,
    pub repeaters_class_arm_name: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SinglePromotionResult {
    pub student_id: String,
    pub student_name: String,
    pub from_class_arm: Option<String>,
    pub to_class_arm: String,
    pub from_level: Option<String>,
    pub to_level: String,
    pub academic_session: String,
    pub promotion_type: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmRef {
    pub id: String,
    pub name: String,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentBatchRow {
    pub student_id: String,
    pub student_name: String,
    pub from_class_arm_id: String,
    pub to_class_arm_id: String,
    pub promotion_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionBatchResult {
    pub batch_id: String,
    pub status: String,
    pub total_students: usize,
    pub successful_promotions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_class_arm: Option<ArmRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeaters_class_arm: Option<ArmRef>,
    pub results: Vec<StudentBatchRow>,
}

#[derive(Debug, Clone)]
struct ArmRow {
    id: String,
    name: String,
    level_id: String,
    level_name: String,
    session_id: String,
    class_teacher_id: Option<String>,
    location: Option<String>,
}

#[derive(Debug, Clone)]
struct RosterRow {
    enrollment_id: String,
    student_id: String,
    student_name: String,
}

fn fetch_arm(
    conn: &Connection,
    school_id: &str,
    arm_id: &str,
) -> Result<Option<ArmRow>, PromotionError> {
    conn.query_row(
        "SELECT ca.id, ca.name, ca.level_id, l.name, ca.academic_session_id,
                ca.class_teacher_id, ca.location
         FROM class_arms ca
         JOIN levels l ON l.id = ca.level_id
         WHERE ca.id = ? AND ca.school_id = ? AND ca.deleted_at IS NULL",
        (arm_id, school_id),
        |r| {
            Ok(ArmRow {
                id: r.get(0)?,
                name: r.get(1)?,
                level_id: r.get(2)?,
                level_name: r.get(3)?,
                session_id: r.get(4)?,
                class_teacher_id: r.get(5)?,
                location: r.get(6)?,
            })
        },
    )
    .optional()
    .map_err(db_err)
}

fn validate_optional_uuid(value: Option<&str>, field: &str) -> Result<(), PromotionError> {
    let Some(value) = value else {
        return Ok(());
    };
    let valid = Uuid::parse_str(value)
        .map(|u| (1..=5).contains(&u.get_version_num()))
        .unwrap_or(false);
    if !valid {
        return Err(PromotionError::new(
            "bad_params",
            format!("{} is not a valid UUID", field),
        )
        .with_details(serde_json::json!({ "field": field, "value": value })));
    }
    Ok(())
}

/// Next level for a source level: a configured progression wins, then the
/// fixed ladder; `None` past the terminal level (graduation).
pub fn next_level(
    conn: &Connection,
    school_id: &str,
    from_level_id: &str,
) -> Result<Option<(String, String)>, PromotionError> {
    let configured: Option<(String, String)> = conn
        .query_row(
            "SELECT l.id, l.name
             FROM level_progressions p
             JOIN levels l ON l.id = p.to_level_id AND l.deleted_at IS NULL
             WHERE p.school_id = ? AND p.from_level_id = ? AND p.deleted_at IS NULL
             ORDER BY p.sort_order
             LIMIT 1",
            (school_id, from_level_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err)?;
    if configured.is_some() {
        return Ok(configured);
    }

    let from_name: Option<String> = conn
        .query_row(
            "SELECT name FROM levels WHERE id = ? AND school_id = ?",
            (from_level_id, school_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    let Some(from_name) = from_name else {
        return Ok(None);
    };

    let position = LEVEL_LADDER
        .iter()
        .position(|rung| rung.eq_ignore_ascii_case(from_name.trim()));
    let Some(position) = position else {
        return Ok(None);
    };
    let Some(next_name) = LEVEL_LADDER.get(position + 1) else {
        return Ok(None);
    };

    conn.query_row(
        "SELECT id, name FROM levels
         WHERE school_id = ? AND UPPER(name) = UPPER(?) AND deleted_at IS NULL",
        (school_id, next_name),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()
    .map_err(db_err)
}

fn default_target_name(source_name: &str, source_level_name: &str) -> String {
    let prefix = format!("{}-", source_level_name);
    match source_name.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(&prefix) && source_name.len() > prefix.len() => {
            source_name[prefix.len()..].to_string()
        }
        _ => source_name.to_string(),
    }
}

/// Single-student placement into an explicit target arm. Shares the cohort
/// path's enrollment-transfer semantics: the old row is deactivated, a new
/// active row is created, and the ledger row lands in the same transaction.
pub fn promote_student(
    conn: &Connection,
    school_id: &str,
    actor_id: &str,
    req: &PromoteStudentRequest,
) -> Result<SinglePromotionResult, PromotionError> {
    let student: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT id, last_name, first_name, status FROM students
             WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
            (&req.student_id, school_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((student_id, last_name, first_name, status)) = student else {
        return Err(PromotionError::new("not_found", "student not found"));
    };
    if status != "ACTIVE" {
        return Err(PromotionError::new(
            "bad_params",
            format!("student is not active (status {})", status),
        ));
    }

    let Some(target) = fetch_arm(conn, school_id, &req.target_class_arm_id)? else {
        return Err(PromotionError::new("not_found", "target class arm not found"));
    };

    let session_name: String = conn
        .query_row(
            "SELECT name FROM academic_sessions WHERE id = ?",
            [&target.session_id],
            |r| r.get(0),
        )
        .map_err(db_err)?;

    let current: Option<(String, String, String, String, String, String)> = conn
        .query_row(
            "SELECT e.id, e.class_arm_id, ca.name, ca.level_id, l.name, e.academic_session_id
             FROM class_arm_students e
             JOIN class_arms ca ON ca.id = e.class_arm_id
             JOIN levels l ON l.id = ca.level_id
             WHERE e.student_id = ? AND e.is_active = 1
             ORDER BY e.enrolled_at DESC
             LIMIT 1",
            [&student_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            },
        )
        .optional()
        .map_err(db_err)?;

    let mut warnings: Vec<String> = Vec::new();
    let occupancy: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM class_arm_students WHERE class_arm_id = ? AND is_active = 1",
            [&target.id],
            |r| r.get(0),
        )
        .map_err(db_err)?;
    if occupancy >= CLASS_ARM_CAPACITY {
        warnings.push(format!(
            "target class arm is at capacity ({} of {})",
            occupancy, CLASS_ARM_CAPACITY
        ));
    }

    let now = now_rfc3339();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| PromotionError::new("db_tx_failed", e.to_string()))?;

    if let Some((enrollment_id, _, _, _, _, _)) = &current {
        tx.execute(
            "UPDATE class_arm_students SET is_active = 0, left_at = ? WHERE id = ?",
            (&now, enrollment_id),
        )
        .map_err(|e| PromotionError::new("db_update_failed", e.to_string()))?;
    }

    tx.execute(
        "INSERT INTO class_arm_students(
            id, school_id, student_id, class_arm_id, academic_session_id,
            is_active, enrolled_at)
         VALUES(?, ?, ?, ?, ?, 1, ?)",
        (
            Uuid::new_v4().to_string(),
            school_id,
            &student_id,
            &target.id,
            &target.session_id,
            &now,
        ),
    )
    .map_err(|e| PromotionError::new("db_insert_failed", e.to_string()))?;

    let (from_arm_id, from_arm_name, from_level_id, from_level_name, from_session_id) =
        match &current {
            Some((_, arm_id, arm_name, level_id, level_name, session_id)) => (
                Some(arm_id.clone()),
                Some(arm_name.clone()),
                Some(level_id.clone()),
                Some(level_name.clone()),
                Some(session_id.clone()),
            ),
            None => (None, None, None, None, None),
        };

    tx.execute(
        "INSERT INTO student_promotions(
            id, school_id, student_id,
            from_class_arm_id, to_class_arm_id,
            from_level_id, to_level_id,
            from_academic_session_id, to_academic_session_id,
            promotion_type, promotion_date, promoted_by, notes, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 'MANUAL', ?, ?, ?, ?)",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            school_id,
            &student_id,
            &from_arm_id,
            &target.id,
            &from_level_id,
            &target.level_id,
            &from_session_id,
            &target.session_id,
            &now,
            actor_id,
            &req.notes,
            &now,
        ],
    )
    .map_err(|e| PromotionError::new("db_insert_failed", e.to_string()))?;

    tx.commit()
        .map_err(|e| PromotionError::new("db_tx_failed", e.to_string()))?;

    Ok(SinglePromotionResult {
        student_id,
        student_name: format!("{}, {}", last_name, first_name),
        from_class_arm: from_arm_name,
        to_class_arm: target.name,
        from_level: from_level_name,
        to_level: target.level_name,
        academic_session: session_name,
        promotion_type: "MANUAL".to_string(),
        warnings,
    })
}

/// Cohort path: the whole selection moves (or repeats) in one transaction, or
/// nothing does.
pub fn promote_class_arm(
    conn: &Connection,
    school_id: &str,
    actor_id: &str,
    req: &PromoteClassArmRequest,
) -> Result<PromotionBatchResult, PromotionError> {
    validate_optional_uuid(
        req.existing_target_class_arm_id.as_deref(),
        "existingTargetClassArmId",
    )?;
    validate_optional_uuid(req.repeaters_class_arm_id.as_deref(), "repeatersClassArmId")?;

    let Some(source) = fetch_arm(conn, school_id, &req.source_class_arm_id)? else {
        return Err(PromotionError::new("not_found", "source class arm not found"));
    };

    let target_session: Option<(String, String)> = conn
        .query_row(
            "SELECT id, name FROM academic_sessions
             WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
            (&req.target_session_id, school_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((target_session_id, _target_session_name)) = target_session else {
        return Err(PromotionError::new(
            "not_found",
            "target academic session not found",
        ));
    };

    let mut stmt = conn
        .prepare(
            "SELECT e.id, e.student_id, s.last_name, s.first_name
             FROM class_arm_students e
             JOIN students s ON s.id = e.student_id
             WHERE e.class_arm_id = ? AND e.is_active = 1
             ORDER BY s.last_name, s.first_name",
        )
        .map_err(db_err)?;
    let roster: Vec<RosterRow> = stmt
        .query_map([&source.id], |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(RosterRow {
                enrollment_id: r.get(0)?,
                student_id: r.get(1)?,
                student_name: format!("{}, {}", last, first),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    drop(stmt);

    let selection: Vec<RosterRow> = match &req.student_ids {
        Some(ids) => {
            let missing: Vec<&String> = ids
                .iter()
                .filter(|id| !roster.iter().any(|row| row.student_id == **id))
                .collect();
            if !missing.is_empty() {
                return Err(PromotionError::new(
                    "not_found",
                    "some students are not actively enrolled in the source class arm",
                )
                .with_details(serde_json::json!({ "studentIds": missing })));
            }
            roster
                .into_iter()
                .filter(|row| ids.contains(&row.student_id))
                .collect()
        }
        None => roster,
    };
    if selection.is_empty() {
        return Err(PromotionError::new(
            "bad_params",
            "no students selected for promotion",
        ));
    }

    let target_level: (String, String) = match req.promotion_type {
        PromotionType::Repeat => (source.level_id.clone(), source.level_name.clone()),
        PromotionType::Promote => match &req.target_level_id {
            Some(level_id) => {
                let level: Option<(String, String)> = conn
                    .query_row(
                        "SELECT id, name FROM levels
                         WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
                        (level_id, school_id),
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()
                    .map_err(db_err)?;
                level.ok_or_else(|| PromotionError::new("not_found", "target level not found"))?
            }
            None => next_level(conn, school_id, &source.level_id)?.ok_or_else(|| {
                PromotionError::new(
                    "bad_params",
                    format!("no next level configured beyond '{}'", source.level_name),
                )
            })?,
        },
    };

    let now = now_rfc3339();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| PromotionError::new("db_tx_failed", e.to_string()))?;

    let destination = match req.promotion_type {
        PromotionType::Promote => resolve_destination_arm(
            &tx,
            school_id,
            &source,
            &target_session_id,
            &target_level,
            req.use_existing_class_arm,
            req.existing_target_class_arm_id.as_deref(),
            req.target_class_arm_name.as_deref(),
            &now,
        )?,
        PromotionType::Repeat => resolve_repeaters_arm(
            &tx,
            school_id,
            &source,
            &target_session_id,
            req.repeaters_class_arm_id.as_deref(),
            req.repeaters_class_arm_name.as_deref(),
            &now,
        )?,
    };

    let ledger_type = req.promotion_type.ledger_type();
    let mut results: Vec<StudentBatchRow> = Vec::with_capacity(selection.len());
    for row in &selection {
        // Same rule as the single-student path; a mid-batch failure here rolls
        // the whole cohort back.
        let status: String = tx
            .query_row(
                "SELECT status FROM students WHERE id = ?",
                [&row.student_id],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        if status != "ACTIVE" {
            return Err(PromotionError::new(
                "bad_params",
                format!("student '{}' is not active (status {})", row.student_name, status),
            )
            .with_details(serde_json::json!({ "studentId": row.student_id })));
        }

        tx.execute(
            "UPDATE class_arm_students SET is_active = 0, left_at = ? WHERE id = ?",
            (&now, &row.enrollment_id),
        )
        .map_err(|e| PromotionError::new("db_update_failed", e.to_string()))?;

        tx.execute(
            "INSERT INTO class_arm_students(
                id, school_id, student_id, class_arm_id, academic_session_id,
                is_active, enrolled_at)
             VALUES(?, ?, ?, ?, ?, 1, ?)",
            (
                Uuid::new_v4().to_string(),
                school_id,
                &row.student_id,
                &destination.id,
                &target_session_id,
                &now,
            ),
        )
        .map_err(|e| PromotionError::new("db_insert_failed", e.to_string()))?;

        tx.execute(
            "INSERT INTO student_promotions(
                id, school_id, student_id,
                from_class_arm_id, to_class_arm_id,
                from_level_id, to_level_id,
                from_academic_session_id, to_academic_session_id,
                promotion_type, promotion_date, promoted_by, notes, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                school_id,
                &row.student_id,
                &source.id,
                &destination.id,
                &source.level_id,
                &target_level.0,
                &source.session_id,
                &target_session_id,
                ledger_type,
                &now,
                actor_id,
                &req.notes,
                &now,
            ],
        )
        .map_err(|e| PromotionError::new("db_insert_failed", e.to_string()))?;

        results.push(StudentBatchRow {
            student_id: row.student_id.clone(),
            student_name: row.student_name.clone(),
            from_class_arm_id: source.id.clone(),
            to_class_arm_id: destination.id.clone(),
            promotion_type: ledger_type.to_string(),
        });
    }

    tx.commit()
        .map_err(|e| PromotionError::new("db_tx_failed", e.to_string()))?;

    let (target_class_arm, repeaters_class_arm) = match req.promotion_type {
        PromotionType::Promote => (Some(destination), None),
        PromotionType::Repeat => (None, Some(destination)),
    };

    Ok(PromotionBatchResult {
        batch_id: format!("batch-{}", chrono::Utc::now().timestamp_millis()),
        status: "COMPLETED".to_string(),
        total_students: selection.len(),
        successful_promotions: results.len(),
        target_class_arm,
        repeaters_class_arm,
        results,
    })
}

#[allow(clippy::too_many_arguments)]
fn resolve_destination_arm(
    conn: &Connection,
    school_id: &str,
    source: &ArmRow,
    target_session_id: &str,
    target_level: &(String, String),
    use_existing: bool,
    existing_id: Option<&str>,
    name_override: Option<&str>,
    now: &str,
) -> Result<ArmRef, PromotionError> {
    if use_existing {
        let Some(existing_id) = existing_id else {
            return Err(PromotionError::new(
                "bad_params",
                "existingTargetClassArmId is required when useExistingClassArm is set",
            ));
        };
        let Some(arm) = fetch_arm(conn, school_id, existing_id)? else {
            return Err(PromotionError::new(
                "not_found",
                "existing target class arm not found",
            ));
        };
        if arm.level_id != target_level.0 || arm.session_id != target_session_id {
            return Err(PromotionError::new(
                "bad_params",
                "existing target class arm is not in the target level and session",
            ));
        }
        return Ok(ArmRef {
            id: arm.id,
            name: arm.name,
            created: false,
        });
    }

    let name = name_override
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| default_target_name(&source.name, &source.level_name));

    create_arm(
        conn,
        school_id,
        target_session_id,
        &target_level.0,
        &name,
        source,
        now,
    )
}

fn resolve_repeaters_arm(
    conn: &Connection,
    school_id: &str,
    source: &ArmRow,
    target_session_id: &str,
    existing_id: Option<&str>,
    name_override: Option<&str>,
    now: &str,
) -> Result<ArmRef, PromotionError> {
    if let Some(existing_id) = existing_id {
        let Some(arm) = fetch_arm(conn, school_id, existing_id)? else {
            return Err(PromotionError::new(
                "not_found",
                "repeaters class arm not found",
            ));
        };
        // Repeaters stay in the source level.
        if arm.level_id != source.level_id || arm.session_id != target_session_id {
            return Err(PromotionError::new(
                "bad_params",
                "repeaters class arm must be in the source level within the target session",
            ));
        }
        return Ok(ArmRef {
            id: arm.id,
            name: arm.name,
            created: false,
        });
    }

    let name = name_override
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("{}-Repeaters", source.name));

    create_arm(
        conn,
        school_id,
        target_session_id,
        &source.level_id,
        &name,
        source,
        now,
    )
}

fn create_arm(
    conn: &Connection,
    school_id: &str,
    session_id: &str,
    level_id: &str,
    name: &str,
    source: &ArmRow,
    now: &str,
) -> Result<ArmRef, PromotionError> {
    let clash: Option<String> = conn
        .query_row(
            "SELECT id FROM class_arms
             WHERE school_id = ? AND academic_session_id = ? AND level_id = ?
               AND UPPER(name) = UPPER(?) AND deleted_at IS NULL",
            (school_id, session_id, level_id, name),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if clash.is_some() {
        return Err(PromotionError::new(
            "conflict",
            format!(
                "class arm '{}' already exists in the target level and session",
                name
            ),
        ));
    }

    let arm_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO class_arms(
            id, school_id, academic_session_id, level_id, name,
            class_teacher_id, location, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &arm_id,
            school_id,
            session_id,
            level_id,
            name,
            &source.class_teacher_id,
            &source.location,
            now,
        ),
    )
    .map_err(|e| PromotionError::new("db_insert_failed", e.to_string()))?;

    Ok(ArmRef {
        id: arm_id,
        name: name.to_string(),
        created: true,
    })
}
