use crate::domain::account::Amount;
use crate::domain::endorsement::{Direction, EndorsementType, NewEndorsement, RequestId};
use crate::error::{EndorseError, Result, ValidationError};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum RowType {
    Addition,
    Deletion,
    Modification,
    Topup,
}

#[derive(Debug, Deserialize)]
struct Row {
    #[serde(rename = "type")]
    row_type: RowType,
    employer: String,
    insurer: Option<String>,
    reference: String,
    effective_date: Option<NaiveDate>,
    amount: Option<Decimal>,
    direction: Option<Direction>,
}

/// One line of the intake file.
#[derive(Debug, Clone, PartialEq)]
pub enum InputRecord {
    Endorsement(NewEndorsement),
    /// An external payment credited to the employer's account.
    TopUp {
        employer_id: String,
        amount: Amount,
        external_ref: String,
    },
}

/// Reads endorsement requests and top-ups from a CSV source with the
/// columns `type,employer,insurer,reference,effective_date,amount,direction`.
///
/// For endorsements `reference` is the request id; for top-ups it is the
/// payment reference used to de-duplicate credits.
pub struct RequestReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> RequestReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily yields one record per line.
    pub fn records(self) -> impl Iterator<Item = Result<InputRecord>> {
        self.reader
            .into_deserialize::<Row>()
            .map(|row| row.map_err(EndorseError::from).and_then(InputRecord::try_from))
    }
}

impl TryFrom<Row> for InputRecord {
    type Error = EndorseError;

    fn try_from(row: Row) -> Result<Self> {
        let kind = match row.row_type {
            RowType::Topup => {
                let amount = row
                    .amount
                    .ok_or(ValidationError::MissingField("amount"))?;
                return Ok(InputRecord::TopUp {
                    employer_id: row.employer,
                    amount: Amount::new(amount)?,
                    external_ref: row.reference,
                });
            }
            RowType::Addition => EndorsementType::Addition,
            RowType::Deletion => EndorsementType::Deletion,
            RowType::Modification => EndorsementType::Modification,
        };

        let insurer_id = row
            .insurer
            .filter(|insurer| !insurer.is_empty())
            .ok_or(ValidationError::MissingField("insurer"))?;
        let requested_effective_date = row
            .effective_date
            .ok_or(ValidationError::MissingField("effective_date"))?;
        Ok(InputRecord::Endorsement(NewEndorsement {
            request_id: RequestId::new(row.reference),
            employer_id: row.employer,
            insurer_id,
            kind,
            requested_effective_date,
            amount: row.amount,
            cost_direction: row.direction,
            payload: serde_json::Value::Null,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const HEADER: &str = "type, employer, insurer, reference, effective_date, amount, direction";

    fn read(body: &str) -> Vec<Result<InputRecord>> {
        let data = format!("{HEADER}\n{body}");
        RequestReader::new(data.as_bytes()).records().collect()
    }

    #[test]
    fn test_reads_endorsements_and_top_ups() {
        let records = read(
            "topup, emp-1, , pay-1, , 100.0,\n\
             addition, emp-1, ins-1, req-1, 2024-01-01, 80,\n\
             modification, emp-1, ins-1, req-2, 2024-02-01, 12.5, credit\n\
             deletion, emp-1, ins-1, req-3, 2024-01-01, ,",
        );
        assert_eq!(records.len(), 4);

        assert_eq!(
            records[0].as_ref().unwrap(),
            &InputRecord::TopUp {
                employer_id: "emp-1".into(),
                amount: Amount::new(dec!(100)).unwrap(),
                external_ref: "pay-1".into(),
            }
        );
        match records[2].as_ref().unwrap() {
            InputRecord::Endorsement(new) => {
                assert_eq!(new.kind, EndorsementType::Modification);
                assert_eq!(new.amount, Some(dec!(12.5)));
                assert_eq!(new.cost_direction, Some(Direction::Credit));
            }
            other => panic!("unexpected record {other:?}"),
        }
        match records[3].as_ref().unwrap() {
            InputRecord::Endorsement(new) => assert_eq!(new.amount, None),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_endorsement_without_date_is_rejected() {
        let records = read("addition, emp-1, ins-1, req-1, , 80,");
        assert!(matches!(
            records[0],
            Err(EndorseError::Validation(ValidationError::MissingField("effective_date")))
        ));
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        let records = read("refund, emp-1, ins-1, req-1, 2024-01-01, 80,");
        assert!(matches!(records[0], Err(EndorseError::Csv(_))));
    }

    #[test]
    fn test_negative_top_up_is_rejected() {
        let records = read("topup, emp-1, , pay-1, , -5,");
        assert!(matches!(records[0], Err(EndorseError::Ledger(_))));
    }
}
