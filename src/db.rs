use crate::model::{
    ClassGrid, ClassInfo, Subject, SubjectAllocation, Teacher, Timetable, TimetableCell, Weekday,
};
use crate::substitution::Substitution;
use anyhow::Context;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "timetable.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            school_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value_json TEXT NOT NULL,
            PRIMARY KEY(school_id, key)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            localized_name TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_school ON subjects(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teachers_school ON teachers(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            section TEXT,
            class_teacher_id TEXT,
            FOREIGN KEY(class_teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_school ON classes(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_subjects(
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(class_id, subject_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    ensure_class_subjects_periods_per_week(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_allocations(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            subject_name TEXT NOT NULL,
            UNIQUE(teacher_id, class_id, subject_id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_allocations_class ON subject_allocations(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_cells(
            school_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            day TEXT NOT NULL,
            period_id INTEGER NOT NULL,
            subject_id TEXT,
            subject_name TEXT,
            teacher_id TEXT,
            teacher_name TEXT,
            room TEXT,
            PRIMARY KEY(class_id, day, period_id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_timetable_cells_updated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_cells_teacher
         ON timetable_cells(school_id, teacher_id, day, period_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_meta(
            class_id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            generated_at TEXT NOT NULL,
            subject_order TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS substitutions(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            date TEXT NOT NULL,
            period_id INTEGER NOT NULL,
            substitute_teacher_id TEXT NOT NULL,
            reason TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(class_id, date, period_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(substitute_teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_substitutions_date ON substitutions(school_id, date)",
        [],
    )?;

    Ok(conn)
}

fn ensure_class_subjects_periods_per_week(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "class_subjects", "periods_per_week")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE class_subjects ADD COLUMN periods_per_week INTEGER",
        [],
    )?;
    Ok(())
}

fn ensure_timetable_cells_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "timetable_cells", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE timetable_cells ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn settings_get_json(
    conn: &Connection,
    school_id: &str,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE school_id = ? AND key = ?",
            (school_id, key),
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("setting {} is not valid JSON", key))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    school_id: &str,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(school_id, key, value_json) VALUES(?, ?, ?)
         ON CONFLICT(school_id, key) DO UPDATE SET value_json = excluded.value_json",
        (school_id, key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn list_subjects(conn: &Connection, school_id: &str) -> anyhow::Result<Vec<Subject>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, localized_name FROM subjects WHERE school_id = ? ORDER BY name, id",
    )?;
    let rows = stmt
        .query_map([school_id], |r| {
            Ok(Subject {
                id: r.get(0)?,
                name: r.get(1)?,
                localized_name: r.get(2)?,
                periods_per_week: None,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_teachers(conn: &Connection, school_id: &str) -> anyhow::Result<Vec<Teacher>> {
    let mut stmt =
        conn.prepare("SELECT id, name FROM teachers WHERE school_id = ? ORDER BY name, id")?;
    let rows = stmt
        .query_map([school_id], |r| {
            Ok(Teacher {
                id: r.get(0)?,
                name: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_teacher(
    conn: &Connection,
    school_id: &str,
    teacher_id: &str,
) -> anyhow::Result<Option<Teacher>> {
    Ok(conn
        .query_row(
            "SELECT id, name FROM teachers WHERE school_id = ? AND id = ?",
            (school_id, teacher_id),
            |r| {
                Ok(Teacher {
                    id: r.get(0)?,
                    name: r.get(1)?,
                })
            },
        )
        .optional()?)
}

pub fn get_subject(
    conn: &Connection,
    school_id: &str,
    subject_id: &str,
) -> anyhow::Result<Option<Subject>> {
    Ok(conn
        .query_row(
            "SELECT id, name, localized_name FROM subjects WHERE school_id = ? AND id = ?",
            (school_id, subject_id),
            |r| {
                Ok(Subject {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    localized_name: r.get(2)?,
                    periods_per_week: None,
                })
            },
        )
        .optional()?)
}

fn class_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ClassInfo> {
    Ok(ClassInfo {
        id: r.get(0)?,
        name: r.get(1)?,
        section: r.get(2)?,
        class_teacher_id: r.get(3)?,
    })
}

pub fn list_classes(conn: &Connection, school_id: &str) -> anyhow::Result<Vec<ClassInfo>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, section, class_teacher_id
         FROM classes WHERE school_id = ?
         ORDER BY name, section, id",
    )?;
    let rows = stmt
        .query_map([school_id], class_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_class(
    conn: &Connection,
    school_id: &str,
    class_id: &str,
) -> anyhow::Result<Option<ClassInfo>> {
    Ok(conn
        .query_row(
            "SELECT id, name, section, class_teacher_id
             FROM classes WHERE school_id = ? AND id = ?",
            (school_id, class_id),
            class_from_row,
        )
        .optional()?)
}

/// The class's explicit subject list, or `None` when the class has none.
pub fn class_subjects(conn: &Connection, class_id: &str) -> anyhow::Result<Option<Vec<Subject>>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.name, s.localized_name, cs.periods_per_week
         FROM class_subjects cs
         JOIN subjects s ON s.id = cs.subject_id
         WHERE cs.class_id = ?
         ORDER BY cs.sort_order",
    )?;
    let rows = stmt
        .query_map([class_id], |r| {
            let ppw: Option<i64> = r.get(3)?;
            Ok(Subject {
                id: r.get(0)?,
                name: r.get(1)?,
                localized_name: r.get(2)?,
                periods_per_week: ppw.and_then(|v| u32::try_from(v).ok()),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(if rows.is_empty() { None } else { Some(rows) })
}

/// Falls back to the full catalogue when the class has no explicit list.
pub fn subjects_pool_for_class(
    conn: &Connection,
    school_id: &str,
    class_id: &str,
) -> anyhow::Result<Vec<Subject>> {
    match class_subjects(conn, class_id)? {
        Some(v) => Ok(v),
        None => list_subjects(conn, school_id),
    }
}

pub fn list_allocations(
    conn: &Connection,
    school_id: &str,
    class_id: Option<&str>,
) -> anyhow::Result<Vec<(String, SubjectAllocation)>> {
    let mut stmt = conn.prepare(
        "SELECT id, teacher_id, class_id, subject_id, subject_name
         FROM subject_allocations
         WHERE school_id = ?1 AND (?2 IS NULL OR class_id = ?2)
         ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map((school_id, class_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                SubjectAllocation {
                    teacher_id: r.get(1)?,
                    class_id: r.get(2)?,
                    subject_id: r.get(3)?,
                    subject_name: r.get(4)?,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_cells(
    conn: &Connection,
    school_id: &str,
    class_id: Option<&str>,
) -> anyhow::Result<Timetable> {
    let mut stmt = conn.prepare(
        "SELECT class_id, day, period_id, subject_id, subject_name, teacher_id, teacher_name, room
         FROM timetable_cells
         WHERE school_id = ?1 AND (?2 IS NULL OR class_id = ?2)",
    )?;
    let mut rows = stmt.query((school_id, class_id))?;
    let mut out = Timetable::new();
    while let Some(r) = rows.next()? {
        let cid: String = r.get(0)?;
        let day_raw: String = r.get(1)?;
        let Some(day) = Weekday::parse(&day_raw) else {
            tracing::warn!(class_id = %cid, day = %day_raw, "skipping cell with unknown day");
            continue;
        };
        let period_id: i64 = r.get(2)?;
        let Ok(period_id) = u32::try_from(period_id) else {
            continue;
        };
        out.entry(cid).or_default().entry(day).or_default().insert(
            period_id,
            TimetableCell {
                subject_id: r.get(3)?,
                subject_name: r.get(4)?,
                teacher_id: r.get(5)?,
                teacher_name: r.get(6)?,
                room: r.get(7)?,
            },
        );
    }
    Ok(out)
}

pub fn load_timetable(conn: &Connection, school_id: &str) -> anyhow::Result<Timetable> {
    load_cells(conn, school_id, None)
}

pub fn load_class_grid(
    conn: &Connection,
    school_id: &str,
    class_id: &str,
) -> anyhow::Result<ClassGrid> {
    Ok(load_cells(conn, school_id, Some(class_id))?
        .remove(class_id)
        .unwrap_or_default())
}

pub fn insert_cell(
    conn: &Connection,
    school_id: &str,
    class_id: &str,
    day: Weekday,
    period_id: u32,
    cell: &TimetableCell,
    now: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO timetable_cells(
            school_id, class_id, day, period_id,
            subject_id, subject_name, teacher_id, teacher_name, room, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(class_id, day, period_id) DO UPDATE SET
            subject_id = excluded.subject_id,
            subject_name = excluded.subject_name,
            teacher_id = excluded.teacher_id,
            teacher_name = excluded.teacher_name,
            room = excluded.room,
            updated_at = excluded.updated_at",
        rusqlite::params![
            school_id,
            class_id,
            day.as_str(),
            period_id,
            cell.subject_id,
            cell.subject_name,
            cell.teacher_id,
            cell.teacher_name,
            cell.room,
            now,
        ],
    )
}

pub fn list_substitutions(
    conn: &Connection,
    school_id: &str,
    class_id: Option<&str>,
    date: Option<NaiveDate>,
) -> anyhow::Result<Vec<Substitution>> {
    let date_key = date.map(|d| d.format("%Y-%m-%d").to_string());
    let mut stmt = conn.prepare(
        "SELECT s.id, s.class_id, s.date, s.period_id, s.substitute_teacher_id, t.name, s.reason
         FROM substitutions s
         LEFT JOIN teachers t ON t.id = s.substitute_teacher_id
         WHERE s.school_id = ?1
           AND (?2 IS NULL OR s.class_id = ?2)
           AND (?3 IS NULL OR s.date = ?3)
         ORDER BY s.date, s.period_id, s.class_id",
    )?;
    let mut rows = stmt.query((school_id, class_id, date_key))?;
    let mut out = Vec::new();
    while let Some(r) = rows.next()? {
        let date_raw: String = r.get(2)?;
        let date = NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d")
            .with_context(|| format!("bad substitution date {}", date_raw))?;
        let period_id: i64 = r.get(3)?;
        out.push(Substitution {
            id: r.get(0)?,
            class_id: r.get(1)?,
            date,
            period_id: u32::try_from(period_id).unwrap_or(0),
            substitute_teacher_id: r.get(4)?,
            substitute_teacher_name: r.get(5)?,
            reason: r.get(6)?,
        });
    }
    Ok(out)
}
