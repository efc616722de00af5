//! SQLite-backed attendance store.
//!
//! Five collections: classes, students (with the optional encoded
//! descriptor), enrollments, attendance records, and session summaries.
//! Attendance for a (class, date) pair is written with replace-not-append
//! semantics so completion retries never duplicate records.

use std::path::Path;

use rollcall_core::{AttendanceOutcome, AttendanceStatus, RosterStudent};
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
}

/// One class.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClassRow {
    pub id: String,
    pub name: String,
}

/// One enrolled student with the stored descriptor text, as read for
/// gallery construction.
#[derive(Debug, Clone)]
pub struct RosterRow {
    pub student_id: String,
    pub name: String,
    pub descriptor: Option<String>,
}

/// Persisted summary of one completed scan session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionRow {
    pub class_id: String,
    pub date: String,
    pub present_count: u32,
    pub absent_count: u32,
    pub created_at: String,
}

#[derive(Clone)]
pub struct AttendanceStore {
    conn: Connection,
}

impl AttendanceStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path).await?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS classes (
                     id TEXT PRIMARY KEY,
                     name TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS students (
                     id TEXT PRIMARY KEY,
                     name TEXT NOT NULL,
                     descriptor TEXT
                 );
                 CREATE TABLE IF NOT EXISTS enrollments (
                     id TEXT PRIMARY KEY,
                     class_id TEXT NOT NULL REFERENCES classes(id),
                     student_id TEXT NOT NULL REFERENCES students(id),
                     UNIQUE (class_id, student_id)
                 );
                 CREATE TABLE IF NOT EXISTS attendance_records (
                     id TEXT PRIMARY KEY,
                     class_id TEXT NOT NULL REFERENCES classes(id),
                     student_id TEXT NOT NULL REFERENCES students(id),
                     date TEXT NOT NULL,
                     status TEXT NOT NULL CHECK (status IN ('present', 'absent'))
                 );
                 CREATE TABLE IF NOT EXISTS attendance_sessions (
                     id TEXT PRIMARY KEY,
                     class_id TEXT NOT NULL REFERENCES classes(id),
                     date TEXT NOT NULL,
                     present_count INTEGER NOT NULL,
                     absent_count INTEGER NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_enrollments_class ON enrollments(class_id);
                 CREATE INDEX IF NOT EXISTS idx_records_class_date ON attendance_records(class_id, date);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    pub async fn create_class(&self, name: &str) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let id_out = id.clone();
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("INSERT INTO classes (id, name) VALUES (?1, ?2)", (&id, &name))?;
                Ok(())
            })
            .await?;
        Ok(id_out)
    }

    pub async fn list_classes(&self) -> Result<Vec<ClassRow>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, name FROM classes ORDER BY name")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(ClassRow {
                            id: row.get(0)?,
                            name: row.get(1)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Create a student row, optionally with an encoded descriptor.
    pub async fn create_student(
        &self,
        name: &str,
        descriptor: Option<String>,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let id_out = id.clone();
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO students (id, name, descriptor) VALUES (?1, ?2, ?3)",
                    (&id, &name, &descriptor),
                )?;
                Ok(())
            })
            .await?;
        Ok(id_out)
    }

    pub async fn create_enrollment(
        &self,
        class_id: &str,
        student_id: &str,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let id_out = id.clone();
        let class_id = class_id.to_string();
        let student_id = student_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO enrollments (id, class_id, student_id) VALUES (?1, ?2, ?3)",
                    (&id, &class_id, &student_id),
                )?;
                Ok(())
            })
            .await?;
        Ok(id_out)
    }

    /// All enrollments for a class with the linked student, descriptor
    /// included when present.
    pub async fn roster_for_class(&self, class_id: &str) -> Result<Vec<RosterRow>, StoreError> {
        let class_id = class_id.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT s.id, s.name, s.descriptor
                     FROM enrollments e JOIN students s ON s.id = e.student_id
                     WHERE e.class_id = ?1
                     ORDER BY s.name",
                )?;
                let rows = stmt
                    .query_map([&class_id], |row| {
                        Ok(RosterRow {
                            student_id: row.get(0)?,
                            name: row.get(1)?,
                            descriptor: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Persist one session's outcomes plus totals, replacing any previous
    /// write for the same (class, date) in a single transaction.
    pub async fn replace_attendance(
        &self,
        class_id: &str,
        date: &str,
        outcomes: &[AttendanceOutcome],
    ) -> Result<(), StoreError> {
        let class_id = class_id.to_string();
        let date = date.to_string();
        let outcomes = outcomes.to_vec();
        let present = outcomes
            .iter()
            .filter(|o| o.status == AttendanceStatus::Present)
            .count() as u32;
        let absent = outcomes.len() as u32 - present;
        let created_at = chrono::Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM attendance_records WHERE class_id = ?1 AND date = ?2",
                    (&class_id, &date),
                )?;
                tx.execute(
                    "DELETE FROM attendance_sessions WHERE class_id = ?1 AND date = ?2",
                    (&class_id, &date),
                )?;
                for outcome in &outcomes {
                    let status = match outcome.status {
                        AttendanceStatus::Present => "present",
                        AttendanceStatus::Absent => "absent",
                    };
                    tx.execute(
                        "INSERT INTO attendance_records (id, class_id, student_id, date, status)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        (
                            uuid::Uuid::new_v4().to_string(),
                            &class_id,
                            &outcome.student_id,
                            &date,
                            status,
                        ),
                    )?;
                }
                tx.execute(
                    "INSERT INTO attendance_sessions (id, class_id, date, present_count, absent_count, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    (
                        uuid::Uuid::new_v4().to_string(),
                        &class_id,
                        &date,
                        present,
                        absent,
                        &created_at,
                    ),
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Attendance records for a (class, date), for status queries and tests.
    pub async fn attendance_for(
        &self,
        class_id: &str,
        date: &str,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let class_id = class_id.to_string();
        let date = date.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT student_id, status FROM attendance_records
                     WHERE class_id = ?1 AND date = ?2 ORDER BY student_id",
                )?;
                let rows = stmt
                    .query_map([&class_id, &date], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    pub async fn session_for(
        &self,
        class_id: &str,
        date: &str,
    ) -> Result<Option<SessionRow>, StoreError> {
        let class_id = class_id.to_string();
        let date = date.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT class_id, date, present_count, absent_count, created_at
                     FROM attendance_sessions WHERE class_id = ?1 AND date = ?2",
                )?;
                let mut rows = stmt.query_map([&class_id, &date], |row| {
                    Ok(SessionRow {
                        class_id: row.get(0)?,
                        date: row.get(1)?,
                        present_count: row.get(2)?,
                        absent_count: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?;
                Ok(rows.next().transpose()?)
            })
            .await?;
        Ok(row)
    }
}

/// View of the roster as the session needs it: enrolled students split from
/// the decodable gallery entries. Rows whose descriptor is missing, blank,
/// or fails to decode appear in the roster but not the gallery — they can
/// only be marked present by hand.
pub fn build_gallery(rows: &[RosterRow]) -> (Vec<RosterStudent>, Vec<rollcall_core::GalleryEntry>) {
    let mut roster = Vec::with_capacity(rows.len());
    let mut gallery = Vec::new();

    for row in rows {
        roster.push(RosterStudent {
            id: row.student_id.clone(),
            name: row.name.clone(),
        });

        let Some(text) = &row.descriptor else {
            continue;
        };
        match rollcall_core::decode(text) {
            Ok(descriptor) if !descriptor.is_blank() => {
                gallery.push(rollcall_core::GalleryEntry {
                    student_id: row.student_id.clone(),
                    name: row.name.clone(),
                    descriptor,
                });
            }
            Ok(_) => {
                tracing::warn!(student_id = %row.student_id, "stored descriptor is blank; skipping");
            }
            Err(err) => {
                tracing::warn!(
                    student_id = %row.student_id,
                    error = %err,
                    "stored descriptor failed to decode; skipping"
                );
            }
        }
    }

    (roster, gallery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{encode, AttendanceStatus, FaceDescriptor};
    use std::collections::{HashMap, HashSet};

    async fn memory_store() -> AttendanceStore {
        AttendanceStore::open(Path::new(":memory:")).await.unwrap()
    }

    #[tokio::test]
    async fn test_roster_round_trip() {
        let store = memory_store().await;
        let class = store.create_class("Physics 101").await.unwrap();
        let s1 = store.create_student("Alice", None).await.unwrap();
        let s2 = store
            .create_student("Bob", Some("AAAA".into()))
            .await
            .unwrap();
        store.create_enrollment(&class, &s1).await.unwrap();
        store.create_enrollment(&class, &s2).await.unwrap();

        let roster = store.roster_for_class(&class).await.unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].name, "Alice");
        assert!(roster[0].descriptor.is_none());
        assert!(roster[1].descriptor.is_some());
    }

    #[tokio::test]
    async fn test_replace_attendance_idempotent() {
        let store = memory_store().await;
        let class = store.create_class("Math").await.unwrap();
        let s1 = store.create_student("Alice", None).await.unwrap();
        let s2 = store.create_student("Bob", None).await.unwrap();
        store.create_enrollment(&class, &s1).await.unwrap();
        store.create_enrollment(&class, &s2).await.unwrap();

        let outcomes = vec![
            AttendanceOutcome { student_id: s1.clone(), status: AttendanceStatus::Present },
            AttendanceOutcome { student_id: s2.clone(), status: AttendanceStatus::Absent },
        ];

        store.replace_attendance(&class, "2026-03-02", &outcomes).await.unwrap();
        store.replace_attendance(&class, "2026-03-02", &outcomes).await.unwrap();

        // Second write replaced, not appended
        let records = store.attendance_for(&class, "2026-03-02").await.unwrap();
        assert_eq!(records.len(), 2);

        let session = store.session_for(&class, "2026-03-02").await.unwrap().unwrap();
        assert_eq!(session.present_count, 1);
        assert_eq!(session.absent_count, 1);
    }

    #[tokio::test]
    async fn test_replace_attendance_overwrites_changed_statuses() {
        let store = memory_store().await;
        let class = store.create_class("Math").await.unwrap();
        let s1 = store.create_student("Alice", None).await.unwrap();
        store.create_enrollment(&class, &s1).await.unwrap();

        let absent = vec![AttendanceOutcome { student_id: s1.clone(), status: AttendanceStatus::Absent }];
        let present = vec![AttendanceOutcome { student_id: s1.clone(), status: AttendanceStatus::Present }];

        store.replace_attendance(&class, "2026-03-02", &absent).await.unwrap();
        store.replace_attendance(&class, "2026-03-02", &present).await.unwrap();

        let records = store.attendance_for(&class, "2026-03-02").await.unwrap();
        assert_eq!(records, vec![(s1, "present".to_string())]);
    }

    #[tokio::test]
    async fn test_duplicate_enrollment_rejected() {
        let store = memory_store().await;
        let class = store.create_class("Math").await.unwrap();
        let s1 = store.create_student("Alice", None).await.unwrap();
        store.create_enrollment(&class, &s1).await.unwrap();
        assert!(store.create_enrollment(&class, &s1).await.is_err());
    }

    #[tokio::test]
    async fn test_build_gallery_skips_undecodable_rows() {
        let good = encode(&FaceDescriptor::new(vec![0.25; 128])).unwrap();
        let rows = vec![
            RosterRow { student_id: "s1".into(), name: "Alice".into(), descriptor: Some(good) },
            RosterRow { student_id: "s2".into(), name: "Bob".into(), descriptor: None },
            RosterRow { student_id: "s3".into(), name: "Carol".into(), descriptor: Some("!!!".into()) },
        ];

        let (roster, gallery) = build_gallery(&rows);
        assert_eq!(roster.len(), 3);
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].student_id, "s1");
    }

    #[tokio::test]
    async fn test_full_enroll_then_match_pipeline() {
        // encode → store → retrieve → decode → match
        let store = memory_store().await;
        let class = store.create_class("History").await.unwrap();

        let reference = FaceDescriptor::new(vec![0.09; 128]);
        let student_id = store
            .create_student("Alice", Some(encode(&reference).unwrap()))
            .await
            .unwrap();
        store.create_enrollment(&class, &student_id).await.unwrap();

        let rows = store.roster_for_class(&class).await.unwrap();
        let (roster, gallery) = build_gallery(&rows);
        assert_eq!(gallery.len(), 1);

        // A probe close to the stored reference matches within threshold
        let mut probe_values = vec![0.09; 128];
        probe_values[0] = 0.11;
        let probe = FaceDescriptor::new(probe_values);
        let hit = rollcall_core::find_best_match(&probe, &gallery, 0.45).unwrap();
        assert_eq!(hit.student_id, student_id);

        // And the reconciled outcome persists as present
        let recognized: HashSet<String> = [hit.student_id].into();
        let outcomes = rollcall_core::reconcile(&roster, &recognized, &HashMap::new());
        store.replace_attendance(&class, "2026-03-02", &outcomes).await.unwrap();
        let records = store.attendance_for(&class, "2026-03-02").await.unwrap();
        assert_eq!(records[0].1, "present");
    }
}
