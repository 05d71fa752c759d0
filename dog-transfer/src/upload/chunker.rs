use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;

use crate::budget::{BudgetReservation, ByteBudget};
use crate::part_math::MAX_PARTS;
use crate::{ByteStream, TransferError, TransferResult};

/// One fixed-size slice of the source, numbered from 1
#[derive(Debug)]
pub(crate) struct PartChunk {
    pub part_number: u32,
    pub body: Bytes,
    /// Keeps the chunk's bytes counted against the buffer budget until the
    /// part request finishes
    pub reservation: Option<BudgetReservation>,
}

/// Re-slice an arbitrary byte stream into `part_size` chunks (the last one may
/// be shorter).
///
/// Budget is reserved before a chunk starts filling, so the source is not
/// read further ahead than `max_buffered_bytes` allows. With an
/// `expected_length`, a source that runs long or short is an error.
pub(crate) fn part_chunks(
    body: ByteStream,
    part_size: u64,
    expected_length: Option<u64>,
    budget: ByteBudget,
) -> impl Stream<Item = TransferResult<PartChunk>> + Send {
    async_stream::try_stream! {
        let mut body = body;
        let mut buffer = BytesMut::new();
        let mut reservation: Option<BudgetReservation> = None;
        let mut part_number: u32 = 0;
        let mut seen: u64 = 0;

        while let Some(next) = body.next().await {
            let mut incoming = next.map_err(TransferError::from)?;
            seen += incoming.len() as u64;
            check_not_longer(seen, expected_length)?;

            while !incoming.is_empty() {
                if reservation.is_none() {
                    reservation = Some(budget.reserve(part_size).await?);
                }
                let room = (part_size - buffer.len() as u64).min(incoming.len() as u64) as usize;
                buffer.extend_from_slice(&incoming.split_to(room));

                if buffer.len() as u64 == part_size {
                    part_number = next_part_number(part_number)?;
                    yield PartChunk {
                        part_number,
                        body: buffer.split().freeze(),
                        reservation: reservation.take(),
                    };
                }
            }
        }

        check_exact(seen, expected_length)?;

        if !buffer.is_empty() {
            part_number = next_part_number(part_number)?;
            yield PartChunk {
                part_number,
                body: buffer.split().freeze(),
                reservation: reservation.take(),
            };
        }
    }
}

fn check_not_longer(seen: u64, expected: Option<u64>) -> TransferResult<()> {
    match expected {
        Some(expected) if seen > expected => Err(TransferError::invalid(format!(
            "source produced more than the declared {} bytes",
            expected
        ))),
        _ => Ok(()),
    }
}

fn check_exact(seen: u64, expected: Option<u64>) -> TransferResult<()> {
    match expected {
        Some(expected) if seen != expected => Err(TransferError::invalid(format!(
            "source produced {} bytes, expected {}",
            seen, expected
        ))),
        _ => Ok(()),
    }
}

fn next_part_number(current: u32) -> TransferResult<u32> {
    if current >= MAX_PARTS {
        return Err(TransferError::invalid(format!(
            "source needs more than {} parts; raise the part size",
            MAX_PARTS
        )));
    }
    Ok(current + 1)
}
