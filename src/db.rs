use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("schoolbook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            school_id TEXT,
            display_name TEXT NOT NULL,
            role TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_school ON users(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_sessions(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            starts_on TEXT,
            ends_on TEXT,
            is_current INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            deleted_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_school ON academic_sessions(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            academic_session_id TEXT NOT NULL,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            is_current INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            deleted_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(academic_session_id) REFERENCES academic_sessions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_terms_session ON terms(academic_session_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS levels(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            deleted_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_levels_school ON levels(school_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_arms(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            academic_session_id TEXT NOT NULL,
            level_id TEXT NOT NULL,
            name TEXT NOT NULL,
            class_teacher_id TEXT,
            location TEXT,
            created_at TEXT NOT NULL,
            deleted_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(academic_session_id) REFERENCES academic_sessions(id),
            FOREIGN KEY(level_id) REFERENCES levels(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_arms_scope
         ON class_arms(school_id, academic_session_id, level_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            created_at TEXT NOT NULL,
            deleted_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_school ON students(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            deleted_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_school ON subjects(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_arm_students(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            class_arm_id TEXT NOT NULL,
            academic_session_id TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            enrolled_at TEXT NOT NULL,
            left_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_arm_id) REFERENCES class_arms(id),
            FOREIGN KEY(academic_session_id) REFERENCES academic_sessions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student
         ON class_arm_students(student_id, academic_session_id, is_active)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_arm
         ON class_arm_students(class_arm_id, is_active)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_templates(
            id TEXT PRIMARY KEY,
            school_id TEXT,
            academic_session_id TEXT,
            name TEXT NOT NULL,
            description TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            is_global_default INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(academic_session_id) REFERENCES academic_sessions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_templates_scope
         ON assessment_templates(school_id, academic_session_id, is_active)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_template_components(
            id TEXT PRIMARY KEY,
            template_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            max_score REAL NOT NULL,
            is_exam INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(template_id) REFERENCES assessment_templates(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_components_template
         ON assessment_template_components(template_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_structures(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            academic_session_id TEXT NOT NULL,
            name TEXT NOT NULL,
            max_score REAL NOT NULL,
            is_exam INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            deleted_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(academic_session_id) REFERENCES academic_sessions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_structures_scope
         ON assessment_structures(school_id, academic_session_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_assessments(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            class_arm_id TEXT NOT NULL,
            name TEXT NOT NULL,
            score REAL NOT NULL,
            is_exam INTEGER NOT NULL DEFAULT 0,
            recorded_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(term_id) REFERENCES terms(id),
            FOREIGN KEY(class_arm_id) REFERENCES class_arms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_student_term
         ON student_assessments(student_id, term_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_arm_term
         ON student_assessments(class_arm_id, term_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_promotions(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            from_class_arm_id TEXT,
            to_class_arm_id TEXT NOT NULL,
            from_level_id TEXT,
            to_level_id TEXT NOT NULL,
            from_academic_session_id TEXT,
            to_academic_session_id TEXT NOT NULL,
            promotion_type TEXT NOT NULL,
            promotion_date TEXT NOT NULL,
            promoted_by TEXT NOT NULL,
            notes TEXT,
            created_at TEXT NOT NULL,
            deleted_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_promotions_student
         ON student_promotions(student_id, promotion_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS level_progressions(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            from_level_id TEXT NOT NULL,
            to_level_id TEXT NOT NULL,
            is_automatic INTEGER NOT NULL DEFAULT 0,
            requires_approval INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            deleted_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(from_level_id) REFERENCES levels(id),
            FOREIGN KEY(to_level_id) REFERENCES levels(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_progressions_from
         ON level_progressions(school_id, from_level_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grading_models(
            school_id TEXT PRIMARY KEY,
            model_json TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS activity_log(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            action TEXT NOT NULL,
            details_json TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activity_school ON activity_log(school_id, created_at)",
        [],
    )?;

    Ok(conn)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
