use crate::domain::subscription::SubscriptionHistoryEvent;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;
use uuid::Uuid;

#[derive(Serialize)]
struct HistoryRow<'a> {
    history_id: Uuid,
    subscription_id: Uuid,
    user_id: &'a str,
    event_id: &'a str,
    event_type: &'a str,
    old_status: &'a str,
    new_status: &'a str,
    disposition: &'a str,
    timestamp: String,
}

impl<'a> From<&'a SubscriptionHistoryEvent> for HistoryRow<'a> {
    fn from(event: &'a SubscriptionHistoryEvent) -> Self {
        Self {
            history_id: event.history_id,
            subscription_id: event.subscription_id,
            user_id: &event.user_id,
            event_id: event.event_id.as_deref().unwrap_or(""),
            event_type: &event.event_type,
            old_status: event.old_status.map(|s| s.as_str()).unwrap_or(""),
            new_status: event.new_status.as_str(),
            disposition: event.disposition.as_str(),
            timestamp: event.timestamp.to_rfc3339(),
        }
    }
}

/// Writes subscription history rows as CSV for audit export.
///
/// Columns: `history_id,subscription_id,user_id,event_id,event_type,old_status,new_status,disposition,timestamp`.
/// Missing values (no event id, no prior status) are written as empty fields.
pub struct HistoryWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> HistoryWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::WriterBuilder::new().from_writer(sink),
        }
    }

    pub fn write_history<'a, I>(&mut self, events: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a SubscriptionHistoryEvent>,
    {
        let mut wrote_any = false;
        for event in events {
            self.writer.serialize(HistoryRow::from(event))?;
            wrote_any = true;
        }
        if !wrote_any {
            self.writer.write_record([
                "history_id",
                "subscription_id",
                "user_id",
                "event_id",
                "event_type",
                "old_status",
                "new_status",
                "disposition",
                "timestamp",
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::subscription::{HistoryDisposition, Subscription, SubscriptionStatus};
    use chrono::Utc;

    #[test]
    fn test_writer_columns_and_rows() {
        let now = Utc::now();
        let sub = Subscription::new("u1", "sub_1", "pro", SubscriptionStatus::Cancelled, now, now);
        let event = SubscriptionHistoryEvent::record(
            &sub,
            Some("evt_9"),
            "customer.subscription.deleted",
            Some(SubscriptionStatus::Active),
            HistoryDisposition::Applied,
            serde_json::Value::Null,
            now,
        );

        let mut out = Vec::new();
        HistoryWriter::new(&mut out).write_history([&event]).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();

        assert_eq!(
            lines.next().unwrap(),
            "history_id,subscription_id,user_id,event_id,event_type,old_status,new_status,disposition,timestamp"
        );
        let row = lines.next().unwrap();
        assert!(row.contains("u1,evt_9,customer.subscription.deleted,ACTIVE,CANCELLED,applied"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_writer_empty_history_still_has_header() {
        let mut out = Vec::new();
        HistoryWriter::new(&mut out)
            .write_history(std::iter::empty())
            .unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("history_id,"));
    }
}
