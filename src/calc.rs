use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::grading::{calculate_grade, parse_grading_model, GradingModel};
use crate::templates;

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub school_id: &'a str,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsFilters {
    pub session_id: Option<String>,
    pub term_id: Option<String>,
    pub subject_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub id: String,
    pub name: String,
    #[serde(skip)]
    pub is_current: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentLine {
    pub id: Option<String>,
    pub name: String,
    pub score: f64,
    pub max_score: Option<f64>,
    pub is_exam: bool,
    pub recorded_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResult {
    pub subject_id: String,
    pub subject_name: String,
    pub assessments: Vec<AssessmentLine>,
    pub total_score: f64,
    pub grade: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallStats {
    pub total_subjects: usize,
    pub total_score: f64,
    pub average_score: f64,
    pub grade: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_students: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentResultsModel {
    pub student_id: String,
    pub student_name: String,
    pub academic_session: SessionRef,
    pub term: TermRef,
    pub subjects: Vec<SubjectResult>,
    pub overall: OverallStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedStudent {
    pub student_id: String,
    pub student_name: String,
    pub total_score: f64,
    pub grade: String,
    pub rank: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRankingModel {
    pub class_arm_id: String,
    pub class_arm_name: String,
    pub term_id: String,
    pub total_students: usize,
    pub entries: Vec<RankedStudent>,
}

#[derive(Debug, Clone)]
struct RecordRow {
    id: String,
    subject_id: String,
    subject_name: String,
    name: String,
    score: f64,
    is_exam: bool,
    recorded_at: String,
}

pub fn resolve_session(
    ctx: &CalcContext<'_>,
    explicit: Option<&str>,
) -> Result<SessionRef, CalcError> {
    if let Some(id) = explicit {
        let row: Option<(String, String, i64)> = ctx
            .conn
            .query_row(
                "SELECT id, name, is_current FROM academic_sessions
                 WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
                (id, ctx.school_id),
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        let Some((id, name, is_current)) = row else {
            return Err(CalcError::new("not_found", "academic session not found"));
        };
        return Ok(SessionRef {
            id,
            name,
            is_current: is_current != 0,
        });
    }

    let current: Option<(String, String)> = ctx
        .conn
        .query_row(
            "SELECT id, name FROM academic_sessions
             WHERE school_id = ? AND is_current = 1 AND deleted_at IS NULL
             LIMIT 1",
            [ctx.school_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    if let Some((id, name)) = current {
        return Ok(SessionRef {
            id,
            name,
            is_current: true,
        });
    }

    let latest: Option<(String, String)> = ctx
        .conn
        .query_row(
            "SELECT id, name FROM academic_sessions
             WHERE school_id = ? AND deleted_at IS NULL
             ORDER BY created_at DESC
             LIMIT 1",
            [ctx.school_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some((id, name)) = latest else {
        return Err(CalcError::new(
            "not_found",
            "no academic session configured for school",
        ));
    };
    Ok(SessionRef {
        id,
        name,
        is_current: false,
    })
}

pub fn resolve_term(
    ctx: &CalcContext<'_>,
    session_id: &str,
    explicit: Option<&str>,
) -> Result<TermRef, CalcError> {
    if let Some(id) = explicit {
        let row: Option<(String, String)> = ctx
            .conn
            .query_row(
                "SELECT id, name FROM terms
                 WHERE id = ? AND school_id = ? AND academic_session_id = ? AND deleted_at IS NULL",
                (id, ctx.school_id, session_id),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        let Some((id, name)) = row else {
            return Err(CalcError::new("not_found", "term not found in session"));
        };
        return Ok(TermRef { id, name });
    }

    let current: Option<(String, String)> = ctx
        .conn
        .query_row(
            "SELECT id, name FROM terms
             WHERE academic_session_id = ? AND is_current = 1 AND deleted_at IS NULL
             LIMIT 1",
            [session_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    if let Some((id, name)) = current {
        return Ok(TermRef { id, name });
    }

    let latest: Option<(String, String)> = ctx
        .conn
        .query_row(
            "SELECT id, name FROM terms
             WHERE academic_session_id = ? AND deleted_at IS NULL
             ORDER BY created_at DESC
             LIMIT 1",
            [session_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some((id, name)) = latest else {
        return Err(CalcError::new("not_found", "no term configured for session"));
    };
    Ok(TermRef { id, name })
}

pub fn load_grading_model(conn: &Connection, school_id: &str) -> Option<GradingModel> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT model_json FROM grading_models WHERE school_id = ?",
            [school_id],
            |r| r.get(0),
        )
        .optional()
        .ok()
        .flatten();
    let raw = raw?;
    let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
    parse_grading_model(&value).ok()
}

pub fn student_results(
    ctx: &CalcContext<'_>,
    student_id: &str,
    filters: &ResultsFilters,
) -> Result<StudentResultsModel, CalcError> {
    let student: Option<(String, String, String)> = ctx
        .conn
        .query_row(
            "SELECT id, last_name, first_name FROM students
             WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
            (student_id, ctx.school_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some((student_id, last_name, first_name)) = student else {
        return Err(CalcError::new("not_found", "student not found"));
    };

    let session = resolve_session(ctx, filters.session_id.as_deref())?;
    let term = resolve_term(ctx, &session.id, filters.term_id.as_deref())?;

    if let Some(subject_id) = filters.subject_id.as_deref() {
        let exists: Option<i64> = ctx
            .conn
            .query_row(
                "SELECT 1 FROM subjects WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
                (subject_id, ctx.school_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        if exists.is_none() {
            return Err(CalcError::new("not_found", "subject not found"));
        }
    }

    let records = fetch_student_records(ctx, &student_id, &term.id, filters.subject_id.as_deref())?;

    // Current-session reads may materialize the school's template from the
    // global default; historical reads never fabricate one.
    let template = if session.is_current {
        templates::resolve_active(ctx.conn, ctx.school_id, &session.id)?
    } else {
        templates::find_for_session(ctx.conn, ctx.school_id, &session.id)?
    };

    let model = load_grading_model(ctx.conn, ctx.school_id);

    let mut groups: Vec<(String, String, Vec<RecordRow>)> = Vec::new();
    for record in records {
        match groups.iter_mut().find(|(id, _, _)| *id == record.subject_id) {
            Some((_, _, rows)) => rows.push(record),
            None => groups.push((
                record.subject_id.clone(),
                record.subject_name.clone(),
                vec![record],
            )),
        }
    }
    groups.sort_by(|a, b| a.1.cmp(&b.1));

    let mut subjects: Vec<SubjectResult> = Vec::with_capacity(groups.len());
    for (subject_id, subject_name, rows) in groups {
        let total_score: f64 = rows.iter().map(|r| r.score).sum();
        let assessments = match &template {
            Some(template) => {
                let mut by_name: HashMap<String, &RecordRow> = HashMap::new();
                for row in &rows {
                    by_name.entry(row.name.to_ascii_lowercase()).or_insert(row);
                }
                template
                    .components
                    .iter()
                    .map(|comp| match by_name.get(&comp.name.to_ascii_lowercase()) {
                        Some(row) => AssessmentLine {
                            id: Some(row.id.clone()),
                            name: comp.name.clone(),
                            score: row.score,
                            max_score: Some(comp.max_score),
                            is_exam: comp.is_exam,
                            recorded_at: Some(row.recorded_at.clone()),
                        },
                        None => AssessmentLine {
                            id: None,
                            name: comp.name.clone(),
                            score: 0.0,
                            max_score: Some(comp.max_score),
                            is_exam: comp.is_exam,
                            recorded_at: None,
                        },
                    })
                    .collect()
            }
            // No rubric survives for this session; report the raw lines.
            None => rows
                .iter()
                .map(|row| AssessmentLine {
                    id: Some(row.id.clone()),
                    name: row.name.clone(),
                    score: row.score,
                    max_score: None,
                    is_exam: row.is_exam,
                    recorded_at: Some(row.recorded_at.clone()),
                })
                .collect(),
        };

        let grade = calculate_grade(total_score, model.as_ref());
        subjects.push(SubjectResult {
            subject_id,
            subject_name,
            assessments,
            total_score,
            grade,
        });
    }

    let total_subjects = subjects.len();
    let total_score: f64 = subjects.iter().map(|s| s.total_score).sum();
    let average_score = if total_subjects > 0 {
        total_score / total_subjects as f64
    } else {
        0.0
    };
    let grade = calculate_grade(average_score, model.as_ref());

    let (position, total_students) = match active_class_arm(ctx, &student_id, &session.id)? {
        Some(class_arm_id) => {
            let ranking = class_arm_ranking(ctx, &term.id, &class_arm_id)?;
            let position = ranking
                .entries
                .iter()
                .find(|e| e.student_id == student_id)
                .map(|e| e.rank);
            (position, Some(ranking.total_students))
        }
        None => (None, None),
    };

    Ok(StudentResultsModel {
        student_name: format!("{}, {}", last_name, first_name),
        student_id,
        academic_session: session,
        term,
        subjects,
        overall: OverallStats {
            total_subjects,
            total_score,
            average_score,
            grade,
            position,
            total_students,
        },
    })
}

pub fn class_arm_ranking(
    ctx: &CalcContext<'_>,
    term_id: &str,
    class_arm_id: &str,
) -> Result<ClassRankingModel, CalcError> {
    let arm: Option<(String, String)> = ctx
        .conn
        .query_row(
            "SELECT id, name FROM class_arms
             WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
            (class_arm_id, ctx.school_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some((class_arm_id, class_arm_name)) = arm else {
        return Err(CalcError::new("not_found", "class arm not found"));
    };

    let term_exists: Option<i64> = ctx
        .conn
        .query_row(
            "SELECT 1 FROM terms WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
            (term_id, ctx.school_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    if term_exists.is_none() {
        return Err(CalcError::new("not_found", "term not found"));
    }

    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT sa.student_id, s.last_name, s.first_name, SUM(sa.score)
             FROM student_assessments sa
             JOIN students s ON s.id = sa.student_id
             WHERE sa.class_arm_id = ? AND sa.term_id = ? AND sa.deleted_at IS NULL
             GROUP BY sa.student_id",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let mut totals: Vec<(String, String, f64)> = stmt
        .query_map((&class_arm_id, term_id), |r| {
            let student_id: String = r.get(0)?;
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            let total: f64 = r.get(3)?;
            Ok((student_id, format!("{}, {}", last, first), total))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    // Highest total first; equal totals settle on ascending student id so rank
    // values are stable across runs.
    totals.sort_by(|a, b| match b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal) {
        Ordering::Equal => a.0.cmp(&b.0),
        other => other,
    });

    let model = load_grading_model(ctx.conn, ctx.school_id);
    let entries: Vec<RankedStudent> = totals
        .into_iter()
        .enumerate()
        .map(|(idx, (student_id, student_name, total_score))| RankedStudent {
            grade: calculate_grade(total_score, model.as_ref()),
            student_id,
            student_name,
            total_score,
            rank: idx as i64 + 1,
        })
        .collect();

    Ok(ClassRankingModel {
        class_arm_id,
        class_arm_name,
        term_id: term_id.to_string(),
        total_students: entries.len(),
        entries,
    })
}

fn active_class_arm(
    ctx: &CalcContext<'_>,
    student_id: &str,
    session_id: &str,
) -> Result<Option<String>, CalcError> {
    ctx.conn
        .query_row(
            "SELECT class_arm_id FROM class_arm_students
             WHERE student_id = ? AND academic_session_id = ? AND is_active = 1
             LIMIT 1",
            (student_id, session_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))
}

fn fetch_student_records(
    ctx: &CalcContext<'_>,
    student_id: &str,
    term_id: &str,
    subject_id: Option<&str>,
) -> Result<Vec<RecordRow>, CalcError> {
    let base = "SELECT sa.id, sa.subject_id, sub.name, sa.name, sa.score, sa.is_exam, sa.recorded_at
         FROM student_assessments sa
         JOIN subjects sub ON sub.id = sa.subject_id
         WHERE sa.student_id = ? AND sa.term_id = ? AND sa.deleted_at IS NULL";

    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<RecordRow> {
        Ok(RecordRow {
            id: r.get(0)?,
            subject_id: r.get(1)?,
            subject_name: r.get(2)?,
            name: r.get(3)?,
            score: r.get(4)?,
            is_exam: r.get::<_, i64>(5)? != 0,
            recorded_at: r.get(6)?,
        })
    };

    let rows = match subject_id {
        Some(subject_id) => {
            let sql = format!("{} AND sa.subject_id = ? ORDER BY sa.recorded_at", base);
            let mut stmt = ctx
                .conn
                .prepare(&sql)
                .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
            stmt.query_map((student_id, term_id, subject_id), map_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?
        }
        None => {
            let sql = format!("{} ORDER BY sa.recorded_at", base);
            let mut stmt = ctx
                .conn
                .prepare(&sql)
                .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
            stmt.query_map((student_id, term_id), map_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?
        }
    };

    Ok(rows)
}
