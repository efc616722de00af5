//! Final present/absent reconciliation for one scan session.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Teacher-entered override for one student, alongside whatever the scan
/// recognized automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManualMark {
    Unset,
    Present,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

/// One enrolled student as the session sees the roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterStudent {
    pub id: String,
    pub name: String,
}

/// The unit persisted at scan completion, one per enrolled student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceOutcome {
    pub student_id: String,
    pub status: AttendanceStatus,
}

/// Merge automatic recognition and manual marks into final outcomes.
///
/// Precedence: an explicit manual mark wins over recognition; with neither,
/// the student is absent. Produces exactly one outcome per enrolled student,
/// in roster order.
pub fn reconcile(
    enrolled: &[RosterStudent],
    recognized: &HashSet<String>,
    manual: &HashMap<String, ManualMark>,
) -> Vec<AttendanceOutcome> {
    enrolled
        .iter()
        .map(|student| {
            let status = match manual.get(&student.id).copied().unwrap_or(ManualMark::Unset) {
                ManualMark::Present => AttendanceStatus::Present,
                ManualMark::Absent => AttendanceStatus::Absent,
                ManualMark::Unset => {
                    if recognized.contains(&student.id) {
                        AttendanceStatus::Present
                    } else {
                        AttendanceStatus::Absent
                    }
                }
            };
            AttendanceOutcome {
                student_id: student.id.clone(),
                status,
            }
        })
        .collect()
}
