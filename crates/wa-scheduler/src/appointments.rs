use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use wa_core::model::{Appointment, AppointmentStatus};

use crate::error::{Result, SchedulerError};
use crate::store::SchedulerStore;

fn status_to_str(s: AppointmentStatus) -> &'static str {
    match s {
        AppointmentStatus::Scheduled => "scheduled",
        AppointmentStatus::Cancelled => "cancelled",
        AppointmentStatus::Completed => "completed",
    }
}

fn status_from_str(s: &str) -> AppointmentStatus {
    match s {
        "cancelled" => AppointmentStatus::Cancelled,
        "completed" => AppointmentStatus::Completed,
        _ => AppointmentStatus::Scheduled,
    }
}

fn row_to_appointment(row: &Row) -> rusqlite::Result<Appointment> {
    let start: String = row.get("start_at")?;
    let end: String = row.get("end_at")?;
    let created_at: String = row.get("created_at")?;
    let status: String = row.get("status")?;
    Ok(Appointment {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        user_id: row.get("user_id")?,
        start: start.parse().unwrap_or_else(|_| Utc::now()),
        end: end.parse().unwrap_or_else(|_| Utc::now()),
        title: row.get("title")?,
        description: row.get("description")?,
        status: status_from_str(&status),
        external_event_id: row.get("external_event_id")?,
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
    })
}

impl SchedulerStore {
    /// Appointments of `agent_id` overlapping `[start, end)`, excluding a
    /// specific row (used by reschedule to ignore its own prior slot) and
    /// cancelled appointments (a cancelled slot does not block a new one).
    pub fn conflicting_appointments(
        &self,
        agent_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_id: Option<i64>,
    ) -> Result<Vec<Appointment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM appointments
             WHERE agent_id = ?1 AND status != 'cancelled'
               AND start_at < ?3 AND end_at > ?2
               AND (?4 IS NULL OR id != ?4)",
        )?;
        let rows = stmt.query_map(
            params![agent_id, start.to_rfc3339(), end.to_rfc3339(), exclude_id],
            row_to_appointment,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn book_appointment(
        &self,
        agent_id: i64,
        user_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        title: &str,
        description: Option<&str>,
        external_event_id: Option<&str>,
    ) -> Result<Appointment> {
        if !self.conflicting_appointments(agent_id, start, end, None)?.is_empty() {
            return Err(SchedulerError::AppointmentConflict {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO appointments
                (agent_id, user_id, start_at, end_at, title, description,
                 status, external_event_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'scheduled', ?7, ?8)",
            params![
                agent_id,
                user_id,
                start.to_rfc3339(),
                end.to_rfc3339(),
                title,
                description,
                external_event_id,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_appointment(id)
    }

    pub fn get_appointment(&self, id: i64) -> Result<Appointment> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM appointments WHERE id = ?1", params![id], row_to_appointment)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    SchedulerError::NotFound(format!("appointment {id}"))
                }
                other => SchedulerError::Database(other),
            })
    }

    pub fn user_upcoming_appointments(&self, agent_id: i64, user_id: i64) -> Result<Vec<Appointment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM appointments
             WHERE agent_id = ?1 AND user_id = ?2 AND status = 'scheduled' AND start_at > ?3
             ORDER BY start_at ASC",
        )?;
        let rows = stmt.query_map(
            params![agent_id, user_id, Utc::now().to_rfc3339()],
            row_to_appointment,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn set_appointment_status(&self, id: i64, status: AppointmentStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE appointments SET status = ?2 WHERE id = ?1",
            params![id, status_to_str(status)],
        )?;
        Ok(())
    }

    pub fn reschedule_appointment(
        &self,
        id: i64,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
    ) -> Result<Appointment> {
        let appointment = self.get_appointment(id)?;
        if !self
            .conflicting_appointments(appointment.agent_id, new_start, new_end, Some(id))?
            .is_empty()
        {
            return Err(SchedulerError::AppointmentConflict {
                start: new_start.to_rfc3339(),
                end: new_end.to_rfc3339(),
            });
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE appointments SET start_at = ?2, end_at = ?3 WHERE id = ?1",
            params![id, new_start.to_rfc3339(), new_end.to_rfc3339()],
        )?;
        drop(conn);
        self.get_appointment(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn window(offset_hours: i64) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = Utc::now() + Duration::hours(offset_hours);
        (start, start + Duration::minutes(30))
    }

    #[test]
    fn overlapping_booking_is_rejected() {
        let store = SchedulerStore::open_in_memory().unwrap();
        let (start, end) = window(5);
        store.book_appointment(1, 1, start, end, "Checkup", None, None).unwrap();

        let overlap_start = start + Duration::minutes(10);
        let overlap_end = end + Duration::minutes(10);
        let result = store.book_appointment(1, 2, overlap_start, overlap_end, "Other", None, None);
        assert!(matches!(result, Err(SchedulerError::AppointmentConflict { .. })));
    }

    #[test]
    fn cancelled_slot_does_not_block_new_booking() {
        let store = SchedulerStore::open_in_memory().unwrap();
        let (start, end) = window(5);
        let appt = store.book_appointment(1, 1, start, end, "Checkup", None, None).unwrap();
        store.set_appointment_status(appt.id, AppointmentStatus::Cancelled).unwrap();

        let rebooked = store.book_appointment(1, 2, start, end, "New", None, None);
        assert!(rebooked.is_ok());
    }

    #[test]
    fn reschedule_excludes_its_own_current_slot() {
        let store = SchedulerStore::open_in_memory().unwrap();
        let (start, end) = window(5);
        let appt = store.book_appointment(1, 1, start, end, "Checkup", None, None).unwrap();

        let moved = store.reschedule_appointment(appt.id, start, end);
        assert!(moved.is_ok());
    }
}
