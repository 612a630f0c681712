use chrono::{DateTime, Duration, Utc};

use crate::domain::{SessionStatus, SessionType, DUO_CAPACITY};

/// Which overlap rule to apply when screening a candidate booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictRule {
    /// Same teacher, overlapping time window.
    Teacher,
    /// Any shared student, overlapping time window.
    Student,
    /// Appending students to an existing Duo session would exceed 2 seats.
    DuoCapacity,
}

impl ConflictRule {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "teacher" => Some(Self::Teacher),
            "student" => Some(Self::Student),
            "duo" => Some(Self::DuoCapacity),
            _ => None,
        }
    }
}

/// A booking being screened. Fields the caller has not decided yet stay
/// None; a candidate without a start or duration never conflicts.
#[derive(Debug, Clone, Default)]
pub struct Candidate {
    pub id: Option<String>,
    pub teacher_id: Option<String>,
    pub student_ids: Vec<String>,
    pub session_type: Option<SessionType>,
    pub starts_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
}

/// A stored session, already materialized with its participants.
#[derive(Debug, Clone)]
pub struct ExistingSession {
    pub id: String,
    pub teacher_id: String,
    pub student_ids: Vec<String>,
    pub session_type: SessionType,
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Default)]
pub struct ConflictCheck {
    pub has_conflict: bool,
    pub conflicting_session_id: Option<String>,
}

impl ConflictCheck {
    fn clear() -> Self {
        Self::default()
    }

    fn against(session: &ExistingSession) -> Self {
        Self {
            has_conflict: true,
            conflicting_session_id: Some(session.id.clone()),
        }
    }
}

/// Half-open interval intersection: [a, a+da) and [b, b+db) overlap iff
/// a < b+db and b < a+da. Touching endpoints do not overlap.
pub fn intervals_overlap(
    a_start: DateTime<Utc>,
    a_minutes: i64,
    b_start: DateTime<Utc>,
    b_minutes: i64,
) -> bool {
    let a_end = a_start + Duration::minutes(a_minutes);
    let b_end = b_start + Duration::minutes(b_minutes);
    a_start < b_end && b_start < a_end
}

/// Screens `candidate` against `existing` under one rule. First match wins;
/// no attempt is made to report every conflict.
pub fn check(
    candidate: &Candidate,
    existing: &[ExistingSession],
    rule: ConflictRule,
) -> ConflictCheck {
    // A candidate with no time window yet cannot collide with anything.
    // This is a permissive default, not a validation failure.
    let (Some(start), Some(minutes)) = (candidate.starts_at, candidate.duration_minutes) else {
        return ConflictCheck::clear();
    };

    for session in existing {
        if !session.status.is_active() {
            continue;
        }
        let same_row = candidate.id.as_deref() == Some(session.id.as_str());
        match rule {
            ConflictRule::Teacher => {
                if same_row {
                    continue;
                }
                if candidate.teacher_id.as_deref() != Some(session.teacher_id.as_str()) {
                    continue;
                }
                if intervals_overlap(start, minutes, session.starts_at, session.duration_minutes) {
                    return ConflictCheck::against(session);
                }
            }
            ConflictRule::Student => {
                if same_row {
                    continue;
                }
                let shared = candidate
                    .student_ids
                    .iter()
                    .any(|sid| session.student_ids.contains(sid));
                if !shared {
                    continue;
                }
                if intervals_overlap(start, minutes, session.starts_at, session.duration_minutes) {
                    return ConflictCheck::against(session);
                }
            }
            ConflictRule::DuoCapacity => {
                // Capacity is only checked against the session being appended
                // to; other Duo sessions are irrelevant regardless of counts.
                if candidate.session_type != Some(SessionType::Duo) || !same_row {
                    continue;
                }
                if session.student_ids.len() + candidate.student_ids.len() > DUO_CAPACITY {
                    return ConflictCheck::against(session);
                }
            }
        }
    }

    ConflictCheck::clear()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 9, hour, minute, 0).unwrap()
    }

    fn stored(id: &str, teacher: &str, students: &[&str], start: DateTime<Utc>) -> ExistingSession {
        ExistingSession {
            id: id.to_string(),
            teacher_id: teacher.to_string(),
            student_ids: students.iter().map(|s| s.to_string()).collect(),
            session_type: SessionType::Solo,
            starts_at: start,
            duration_minutes: 60,
            status: SessionStatus::Scheduled,
        }
    }

    fn candidate(teacher: &str, students: &[&str], start: DateTime<Utc>) -> Candidate {
        Candidate {
            id: None,
            teacher_id: Some(teacher.to_string()),
            student_ids: students.iter().map(|s| s.to_string()).collect(),
            session_type: Some(SessionType::Solo),
            starts_at: Some(start),
            duration_minutes: Some(60),
        }
    }

    #[test]
    fn non_overlapping_intervals_never_conflict() {
        let existing = vec![stored("s1", "t1", &["a"], at(10, 0))];
        let cand = candidate("t1", &["a"], at(11, 30));
        for rule in [
            ConflictRule::Teacher,
            ConflictRule::Student,
            ConflictRule::DuoCapacity,
        ] {
            assert!(!check(&cand, &existing, rule).has_conflict);
        }
    }

    #[test]
    fn touching_endpoints_do_not_overlap() {
        assert!(!intervals_overlap(at(10, 0), 60, at(11, 0), 60));
        assert!(intervals_overlap(at(10, 0), 61, at(11, 0), 60));
    }

    #[test]
    fn same_teacher_overlap_conflicts() {
        let existing = vec![stored("s1", "t1", &["a"], at(10, 0))];
        let res = check(&candidate("t1", &["b"], at(10, 30)), &existing, ConflictRule::Teacher);
        assert!(res.has_conflict);
        assert_eq!(res.conflicting_session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn different_teacher_overlap_is_fine() {
        let existing = vec![stored("s1", "t1", &["a"], at(10, 0))];
        let res = check(&candidate("t2", &["b"], at(10, 30)), &existing, ConflictRule::Teacher);
        assert!(!res.has_conflict);
    }

    #[test]
    fn shared_student_overlap_conflicts() {
        let existing = vec![stored("s1", "t1", &["a", "b"], at(10, 0))];
        let res = check(&candidate("t2", &["b"], at(10, 45)), &existing, ConflictRule::Student);
        assert!(res.has_conflict);
    }

    #[test]
    fn cancelled_sessions_never_conflict() {
        let mut s = stored("s1", "t1", &["a"], at(10, 0));
        s.status = SessionStatus::CancelledByStudent;
        let res = check(&candidate("t1", &["a"], at(10, 0)), &[s], ConflictRule::Teacher);
        assert!(!res.has_conflict);
    }

    #[test]
    fn self_exclusion_applies_to_teacher_and_student_rules() {
        for status in [SessionStatus::Scheduled, SessionStatus::Present] {
            let mut s = stored("s1", "t1", &["a"], at(10, 0));
            s.status = status;
            let mut cand = candidate("t1", &["a"], at(10, 15));
            cand.id = Some("s1".to_string());
            assert!(!check(&cand, &[s.clone()], ConflictRule::Teacher).has_conflict);
            assert!(!check(&cand, &[s], ConflictRule::Student).has_conflict);
        }
    }

    #[test]
    fn missing_time_window_is_permissive() {
        let existing = vec![stored("s1", "t1", &["a"], at(10, 0))];
        let mut cand = candidate("t1", &["a"], at(10, 0));
        cand.duration_minutes = None;
        assert!(!check(&cand, &existing, ConflictRule::Teacher).has_conflict);
        cand.duration_minutes = Some(60);
        cand.starts_at = None;
        assert!(!check(&cand, &existing, ConflictRule::Teacher).has_conflict);
    }

    #[test]
    fn duo_capacity_fires_only_on_the_same_session() {
        let mut full = stored("s1", "t1", &["a", "b"], at(10, 0));
        full.session_type = SessionType::Duo;
        let mut other = stored("s2", "t1", &["c", "d"], at(12, 0));
        other.session_type = SessionType::Duo;

        let mut cand = Candidate {
            id: Some("s1".to_string()),
            teacher_id: Some("t1".to_string()),
            student_ids: vec!["e".to_string()],
            session_type: Some(SessionType::Duo),
            starts_at: Some(at(10, 0)),
            duration_minutes: Some(60),
        };

        let res = check(&cand, &[full.clone(), other.clone()], ConflictRule::DuoCapacity);
        assert!(res.has_conflict);
        assert_eq!(res.conflicting_session_id.as_deref(), Some("s1"));

        // Pointing at the other, equally full Duo session is not this rule's
        // business: only the append target is capacity-checked.
        cand.id = Some("s3".to_string());
        assert!(!check(&cand, &[full, other], ConflictRule::DuoCapacity).has_conflict);
    }

    #[test]
    fn duo_capacity_ignores_non_duo_candidates() {
        let mut s = stored("s1", "t1", &["a", "b"], at(10, 0));
        s.session_type = SessionType::Duo;
        let cand = Candidate {
            id: Some("s1".to_string()),
            teacher_id: None,
            student_ids: vec!["c".to_string()],
            session_type: Some(SessionType::Solo),
            starts_at: Some(at(10, 0)),
            duration_minutes: Some(60),
        };
        assert!(!check(&cand, &[s], ConflictRule::DuoCapacity).has_conflict);
    }
}
