use crate::domain::endorsement::{EndorsementRequest, EndorsementType, Status};
use crate::error::Result;
use chrono::NaiveDate;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct RequestRow<'a> {
    request: &'a str,
    employer: &'a str,
    insurer: &'a str,
    #[serde(rename = "type")]
    kind: EndorsementType,
    status: Status,
    retry_count: u32,
    start_date: Option<NaiveDate>,
    reason: Option<&'a str>,
}

/// Writes one line per endorsement request with its lifecycle outcome.
pub struct RequestWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> RequestWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_requests(&mut self, requests: &[EndorsementRequest]) -> Result<()> {
        if requests.is_empty() {
            self.writer.write_record([
                "request",
                "employer",
                "insurer",
                "type",
                "status",
                "retry_count",
                "start_date",
                "reason",
            ])?;
        }
        for request in requests {
            self.writer.serialize(RequestRow {
                request: request.request_id.as_str(),
                employer: &request.employer_id,
                insurer: &request.insurer_id,
                kind: request.kind,
                status: request.status,
                retry_count: request.retry_count,
                start_date: request.coverage.as_ref().map(|c| c.start_date),
                reason: request.failure_reason.as_deref(),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
