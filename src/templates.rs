use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calc::CalcError;
use crate::db::now_rfc3339;

pub const GLOBAL_DEFAULT_NAME: &str = "Standard Assessment Structure";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateComponent {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub max_score: f64,
    pub is_exam: bool,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: String,
    pub school_id: Option<String>,
    pub academic_session_id: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_active: bool,
    pub is_global_default: bool,
    pub components: Vec<TemplateComponent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewComponent {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub max_score: f64,
    #[serde(default)]
    pub is_exam: bool,
}

/// Component-set invariants: per-component bounds, unique names, exact 100 total.
pub fn validate_components(components: &[NewComponent]) -> Result<(), CalcError> {
    if components.is_empty() {
        return Err(CalcError::new(
            "bad_params",
            "template must declare at least one assessment component",
        ));
    }

    for comp in components {
        let name = comp.name.trim();
        if name.is_empty() {
            return Err(CalcError::new(
                "bad_params",
                "component name must not be empty",
            ));
        }
        if !(comp.max_score >= 1.0 && comp.max_score <= 100.0) {
            return Err(CalcError::new(
                "bad_params",
                format!("component '{}' maxScore must be between 1 and 100", name),
            ));
        }
    }

    let mut seen: Vec<String> = Vec::new();
    let mut duplicates: Vec<String> = Vec::new();
    for comp in components {
        let key = comp.name.trim().to_ascii_lowercase();
        if seen.contains(&key) {
            if !duplicates.contains(&key) {
                duplicates.push(comp.name.trim().to_string());
            }
        } else {
            seen.push(key);
        }
    }
    if !duplicates.is_empty() {
        return Err(CalcError::new(
            "bad_params",
            format!("duplicate component names: {}", duplicates.join(", ")),
        )
        .with_details(serde_json::json!({ "duplicates": duplicates })));
    }

    let total: f64 = components.iter().map(|c| c.max_score).sum();
    if (total - 100.0).abs() > 1e-9 {
        return Err(CalcError::new(
            "bad_params",
            format!("Total score must be exactly 100%, got {}%", total),
        )
        .with_details(serde_json::json!({ "total": total })));
    }

    Ok(())
}

/// Scoped lookup only. Past sessions resolve through this and never fabricate.
pub fn find_for_session(
    conn: &Connection,
    school_id: &str,
    session_id: &str,
) -> Result<Option<Template>, CalcError> {
    let row: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT id, name, description FROM assessment_templates
             WHERE school_id = ? AND academic_session_id = ?
               AND is_active = 1 AND deleted_at IS NULL
             LIMIT 1",
            (school_id, session_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let Some((id, name, description)) = row else {
        return Ok(None);
    };
    let components = load_components(conn, &id)?;
    Ok(Some(Template {
        id,
        school_id: Some(school_id.to_string()),
        academic_session_id: Some(session_id.to_string()),
        name,
        description,
        is_active: true,
        is_global_default: false,
        components,
    }))
}

pub fn find_global_default(conn: &Connection) -> Result<Option<Template>, CalcError> {
    let row: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT id, name, description FROM assessment_templates
             WHERE is_global_default = 1 AND is_active = 1 AND deleted_at IS NULL
               AND school_id IS NULL AND academic_session_id IS NULL
             LIMIT 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let Some((id, name, description)) = row else {
        return Ok(None);
    };
    let components = load_components(conn, &id)?;
    Ok(Some(Template {
        id,
        school_id: None,
        academic_session_id: None,
        name,
        description,
        is_active: true,
        is_global_default: true,
        components,
    }))
}

/// Current-session resolution: an existing scoped template wins; otherwise the
/// global default is copied into the (school, session) scope and the copy is
/// returned. The copy is a materialization, not a reference, so later edits to
/// the global default leave settled sessions alone.
pub fn resolve_active(
    conn: &Connection,
    school_id: &str,
    session_id: &str,
) -> Result<Option<Template>, CalcError> {
    if let Some(existing) = find_for_session(conn, school_id, session_id)? {
        return Ok(Some(existing));
    }

    let Some(default) = find_global_default(conn)? else {
        return Ok(None);
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;

    let template_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    tx.execute(
        "INSERT INTO assessment_templates(
            id, school_id, academic_session_id, name, description,
            is_active, is_global_default, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 1, 0, ?, ?)",
        (
            &template_id,
            school_id,
            session_id,
            &default.name,
            &default.description,
            &now,
            &now,
        ),
    )
    .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;

    let mut components: Vec<TemplateComponent> = Vec::with_capacity(default.components.len());
    for comp in &default.components {
        let component_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO assessment_template_components(
                id, template_id, name, description, max_score, is_exam, sort_order)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &component_id,
                &template_id,
                &comp.name,
                &comp.description,
                comp.max_score,
                comp.is_exam as i64,
                comp.sort_order,
            ),
        )
        .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
        components.push(TemplateComponent {
            id: component_id,
            name: comp.name.clone(),
            description: comp.description.clone(),
            max_score: comp.max_score,
            is_exam: comp.is_exam,
            sort_order: comp.sort_order,
        });
    }

    tx.commit()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;

    Ok(Some(Template {
        id: template_id,
        school_id: Some(school_id.to_string()),
        academic_session_id: Some(session_id.to_string()),
        name: default.name,
        description: default.description,
        is_active: true,
        is_global_default: false,
        components,
    }))
}

pub fn create_global_default(conn: &Connection) -> Result<Template, CalcError> {
    if find_global_default(conn)?.is_some() {
        return Err(CalcError::new(
            "conflict",
            "an active global default template already exists",
        ));
    }

    let seed = [
        ("Test1", 20.0, false),
        ("Test2", 20.0, false),
        ("Exam", 60.0, true),
    ];

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;

    let template_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    tx.execute(
        "INSERT INTO assessment_templates(
            id, school_id, academic_session_id, name, description,
            is_active, is_global_default, created_at, updated_at)
         VALUES(?, NULL, NULL, ?, ?, 1, 1, ?, ?)",
        (
            &template_id,
            GLOBAL_DEFAULT_NAME,
            "Two continuous assessments and one exam",
            &now,
            &now,
        ),
    )
    .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;

    let mut components: Vec<TemplateComponent> = Vec::with_capacity(seed.len());
    for (idx, (name, max_score, is_exam)) in seed.iter().enumerate() {
        let component_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO assessment_template_components(
                id, template_id, name, description, max_score, is_exam, sort_order)
             VALUES(?, ?, ?, NULL, ?, ?, ?)",
            (
                &component_id,
                &template_id,
                name,
                max_score,
                *is_exam as i64,
                idx as i64,
            ),
        )
        .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
        components.push(TemplateComponent {
            id: component_id,
            name: name.to_string(),
            description: None,
            max_score: *max_score,
            is_exam: *is_exam,
            sort_order: idx as i64,
        });
    }

    tx.commit()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;

    Ok(Template {
        id: template_id,
        school_id: None,
        academic_session_id: None,
        name: GLOBAL_DEFAULT_NAME.to_string(),
        description: Some("Two continuous assessments and one exam".to_string()),
        is_active: true,
        is_global_default: true,
        components,
    })
}

/// A template is in use once any live score in its (school, session) scope
/// exists; component-set changes and deletes must refuse at that point.
pub fn template_in_use(
    conn: &Connection,
    school_id: &str,
    session_id: &str,
) -> Result<bool, CalcError> {
    conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM student_assessments sa
            JOIN terms t ON t.id = sa.term_id
            WHERE sa.school_id = ? AND t.academic_session_id = ?
              AND sa.deleted_at IS NULL
         )",
        (school_id, session_id),
        |r| r.get::<_, i64>(0),
    )
    .map(|v| v != 0)
    .map_err(|e| CalcError::new("db_query_failed", e.to_string()))
}

pub fn load_components(
    conn: &Connection,
    template_id: &str,
) -> Result<Vec<TemplateComponent>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, description, max_score, is_exam, sort_order
             FROM assessment_template_components
             WHERE template_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([template_id], |r| {
        Ok(TemplateComponent {
            id: r.get(0)?,
            name: r.get(1)?,
            description: r.get(2)?,
            max_score: r.get(3)?,
            is_exam: r.get::<_, i64>(4)? != 0,
            sort_order: r.get(5)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| CalcError::new("db_query_failed", e.to_string()))
}

/// Replaces a template's component set. Caller is responsible for the in-use
/// guard; this only rewrites rows.
pub fn replace_components(
    conn: &Connection,
    template_id: &str,
    components: &[NewComponent],
) -> Result<Vec<TemplateComponent>, CalcError> {
    conn.execute(
        "DELETE FROM assessment_template_components WHERE template_id = ?",
        [template_id],
    )
    .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;

    let mut out: Vec<TemplateComponent> = Vec::with_capacity(components.len());
    for (idx, comp) in components.iter().enumerate() {
        let component_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO assessment_template_components(
                id, template_id, name, description, max_score, is_exam, sort_order)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &component_id,
                template_id,
                comp.name.trim(),
                &comp.description,
                comp.max_score,
                comp.is_exam as i64,
                idx as i64,
            ),
        )
        .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
        out.push(TemplateComponent {
            id: component_id,
            name: comp.name.trim().to_string(),
            description: comp.description.clone(),
            max_score: comp.max_score,
            is_exam: comp.is_exam,
            sort_order: idx as i64,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comp(name: &str, max_score: f64) -> NewComponent {
        NewComponent {
            name: name.to_string(),
            description: None,
            max_score,
            is_exam: false,
        }
    }

    #[test]
    fn total_must_be_exactly_100() {
        let short = [comp("Test1", 20.0), comp("Exam", 75.0)];
        let err = validate_components(&short).expect_err("95 total");
        assert_eq!(err.code, "bad_params");
        assert!(err.message.contains("got 95"), "message: {}", err.message);

        let exact = [comp("Test1", 20.0), comp("Test2", 20.0), comp("Exam", 60.0)];
        assert!(validate_components(&exact).is_ok());
    }

    #[test]
    fn duplicate_names_are_listed() {
        let dup = [comp("Test1", 30.0), comp("test1", 10.0), comp("Exam", 60.0)];
        let err = validate_components(&dup).expect_err("duplicate names");
        assert_eq!(err.code, "bad_params");
        assert!(err.message.contains("Test1"), "message: {}", err.message);
    }

    #[test]
    fn component_bounds_are_checked() {
        let zero = [comp("Test1", 0.0), comp("Exam", 100.0)];
        assert!(validate_components(&zero).is_err());
        let oversize = [comp("Exam", 101.0)];
        assert!(validate_components(&oversize).is_err());
    }
}
