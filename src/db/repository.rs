//! Row mapping for sessions, divergence records and feedback.
//!
//! Structured sub-objects (verdict, trace, errors) are stored as JSON
//! columns; the queried surfaces (tenant, status, timestamps) are plain
//! columns.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::DatabaseError;
use crate::models::enums::{FeedbackOutcome, SessionStatus};
use crate::models::session::{DivergenceFeedback, DivergenceRecord, SessionRecord};
use crate::stores::FeedbackStore;

pub fn upsert_session(conn: &Connection, record: &SessionRecord) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO sessions
           (id, tenant_id, po_document_id, grn_document_id, invoice_document_id,
            status, verdict_json, agent_trace_json, errors_json, started_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
           status = excluded.status,
           verdict_json = excluded.verdict_json,
           agent_trace_json = excluded.agent_trace_json,
           errors_json = excluded.errors_json,
           completed_at = excluded.completed_at",
        params![
            record.id,
            record.tenant_id,
            record.po_document_id,
            record.grn_document_id,
            record.invoice_document_id,
            record.status.as_str(),
            record
                .verdict
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            serde_json::to_string(&record.agent_trace)?,
            serde_json::to_string(&record.errors)?,
            record.started_at.to_rfc3339(),
            record.completed_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

pub fn get_session(conn: &Connection, id: &str) -> Result<Option<SessionRecord>, DatabaseError> {
    conn.query_row(
        "SELECT id, tenant_id, po_document_id, grn_document_id, invoice_document_id,
                status, verdict_json, agent_trace_json, errors_json, started_at, completed_at
         FROM sessions WHERE id = ?1",
        params![id],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, Option<String>>(10)?,
            ))
        },
    )
    .optional()?
    .map(|(id, tenant_id, po, grn, invoice, status, verdict, trace, errors, started, completed)| {
        Ok(SessionRecord {
            id,
            tenant_id,
            po_document_id: po,
            grn_document_id: grn,
            invoice_document_id: invoice,
            status: SessionStatus::from_str(&status)?,
            verdict: verdict.as_deref().map(serde_json::from_str).transpose()?,
            agent_trace: serde_json::from_str(&trace)?,
            errors: serde_json::from_str(&errors)?,
            started_at: parse_timestamp(&started)?,
            completed_at: completed.as_deref().map(parse_timestamp).transpose()?,
        })
    })
    .transpose()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| DatabaseError::InvalidEnum {
            field: "timestamp".into(),
            value: raw.into(),
        })
}

pub fn insert_divergence_record(
    conn: &Connection,
    record: &DivergenceRecord,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO divergence_records
           (session_id, tenant_id, primary_summary, shadow_summary, similarity,
            threshold_used, alert_triggered, perturbation_summary, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.session_id,
            record.tenant_id,
            record.primary_summary,
            record.shadow_summary,
            record.similarity,
            record.threshold_used,
            record.alert_triggered,
            record.perturbation_summary,
            record.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn list_divergence_records(
    conn: &Connection,
    session_id: &str,
) -> Result<Vec<DivergenceRecord>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT session_id, tenant_id, primary_summary, shadow_summary, similarity,
                threshold_used, alert_triggered, perturbation_summary, created_at
         FROM divergence_records WHERE session_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![session_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, f64>(4)?,
            row.get::<_, f64>(5)?,
            row.get::<_, bool>(6)?,
            row.get::<_, String>(7)?,
            row.get::<_, String>(8)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (session_id, tenant_id, primary, shadow, similarity, threshold, alert, perturbation, created) = row?;
        records.push(DivergenceRecord {
            session_id,
            tenant_id,
            primary_summary: primary,
            shadow_summary: shadow,
            similarity,
            threshold_used: threshold,
            alert_triggered: alert,
            perturbation_summary: perturbation,
            created_at: parse_timestamp(&created)?,
        });
    }
    Ok(records)
}

pub fn insert_feedback(
    conn: &Connection,
    feedback: &DivergenceFeedback,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO divergence_feedback
           (session_id, tenant_id, similarity, threshold_used, was_alert, outcome, submitted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            feedback.session_id,
            feedback.tenant_id,
            feedback.similarity,
            feedback.threshold_used,
            feedback.was_alert,
            feedback.outcome.as_str(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn recent_feedback(
    conn: &Connection,
    tenant_id: &str,
    window: usize,
) -> Result<Vec<DivergenceFeedback>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT session_id, tenant_id, similarity, threshold_used, was_alert, outcome
         FROM divergence_feedback
         WHERE tenant_id = ?1
         ORDER BY id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![tenant_id, window as i64], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, f64>(3)?,
            row.get::<_, bool>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;

    let mut feedback = Vec::new();
    for row in rows {
        let (session_id, tenant_id, similarity, threshold_used, was_alert, outcome) = row?;
        feedback.push(DivergenceFeedback {
            session_id,
            tenant_id,
            similarity,
            threshold_used,
            was_alert,
            outcome: FeedbackOutcome::from_str(&outcome)?,
        });
    }
    Ok(feedback)
}

pub fn upsert_workpaper(
    conn: &Connection,
    workpaper: &crate::workpaper::Workpaper,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO workpapers (session_id, workpaper_json, created_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(session_id) DO UPDATE SET
           workpaper_json = excluded.workpaper_json,
           created_at = excluded.created_at",
        params![
            workpaper.session_id,
            serde_json::to_string(workpaper)?,
            workpaper.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_workpaper(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<crate::workpaper::Workpaper>, DatabaseError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT workpaper_json FROM workpapers WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    raw.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(DatabaseError::from)
}

/// [`FeedbackStore`] backed by the shared SQLite connection, so the
/// adaptive threshold store reads the same rows the API writes.
pub struct SqliteFeedbackStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteFeedbackStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }
}

impl FeedbackStore for SqliteFeedbackStore {
    fn recent(&self, tenant_id: &str, window: usize) -> Vec<DivergenceFeedback> {
        let conn = self.conn.lock().expect("db lock poisoned");
        match recent_feedback(&conn, tenant_id, window) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(tenant_id, error = %e, "feedback read failed, treating as empty");
                Vec::new()
            }
        }
    }

    fn append(&self, feedback: DivergenceFeedback) {
        let conn = self.conn.lock().expect("db lock poisoned");
        if let Err(e) = insert_feedback(&conn, &feedback) {
            tracing::warn!(error = %e, "feedback row not persisted");
        }
    }
}
