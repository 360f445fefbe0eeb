//! Dataset catalogue (C3).
//!
//! For one date range, enumerates every candidate file for every declared
//! dataset by listing the object store under a per-date prefix. Listing
//! fans out across (dataset, date) pairs with bounded concurrency so a
//! wide lookback window doesn't open unbounded concurrent requests
//! against the object store.

use chrono::{Days, NaiveDate, Utc};
use futures::stream::{self, StreamExt};

use crate::dataset::{parse_timestamp, DatasetDefinition, EtlFile, FileSet};
use crate::errors::Error;
use crate::objectstore::ObjectStoreReader;

/// The catalogue's list fan-out never runs more than this many
/// (dataset, date) list calls concurrently.
const MAX_CONCURRENT_LISTS: usize = 10;

/// `days=N` returns today and the previous `N-1` days; `days=0` returns
/// today only. Both bounds are inclusive and in UTC.
pub fn lookback_range(days: u32) -> (NaiveDate, NaiveDate) {
    let today = Utc::now().date_naive();
    let span = days.saturating_sub(1) as u64;
    let from = today.checked_sub_days(Days::new(span)).unwrap_or(today);
    (from, today)
}

fn dates_in_range(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut cursor = from;
    while cursor <= to {
        dates.push(cursor);
        cursor = match cursor.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    dates
}

/// Discover one `FileSet` per dataset definition for the given inclusive
/// UTC date range.
pub async fn discover(
    reader: &dyn ObjectStoreReader,
    datasets: &[DatasetDefinition],
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<FileSet>, Error> {
    let mut file_sets = Vec::with_capacity(datasets.len());
    for dataset in datasets {
        let files = discover_dataset(reader, dataset, from, to).await?;
        file_sets.push(FileSet::new(dataset.clone(), files));
    }
    Ok(file_sets)
}

async fn discover_dataset(
    reader: &dyn ObjectStoreReader,
    dataset: &DatasetDefinition,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<EtlFile>, Error> {
    let dates = dates_in_range(from, to);

    let listings = stream::iter(dates.into_iter().map(|date| async move {
        let prefix = dataset.prefix_for_date(date)?;
        reader.list(&prefix).await
    }))
    .buffer_unordered(MAX_CONCURRENT_LISTS)
    .collect::<Vec<_>>()
    .await;

    let mut files = Vec::new();
    for listing in listings {
        for object in listing? {
            let timestamp = parse_timestamp(&object.key, &dataset.datetime_pattern)?;
            files.push(EtlFile { object, timestamp });
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn days_zero_is_today_only() {
        let (from, to) = lookback_range(0);
        assert_eq!(from, to);
    }

    #[test]
    fn days_n_spans_n_minus_one_prior_days() {
        let (from, to) = lookback_range(5);
        assert_eq!((to - from).num_days(), 4);
    }

    #[test]
    fn dates_in_range_is_inclusive() {
        let from = NaiveDate::from_ymd_opt(2026, 7, 24).unwrap();
        let to = NaiveDate::from_ymd_opt(2026, 7, 26).unwrap();
        assert_eq!(dates_in_range(from, to).len(), 3);
    }
}
