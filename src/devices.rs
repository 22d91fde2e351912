//! Device inspection summaries for reports and the service screen

use serde::Serialize;
use std::cmp::Ordering;

use crate::models::{Device, UNDEFINED_STATUS};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusGroup {
    pub status: String,
    pub count: usize,
    /// Share of the type total, one decimal place
    pub percentage: f64,
    /// Compressed device numbers, e.g. `1-3, 5`
    pub numbers: String,
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeSummary {
    pub device_type: String,
    pub total: usize,
    pub statuses: Vec<StatusGroup>,
}

/// Groups devices by type, then by status.
///
/// Types keep the order in which they first appear. Devices numbered 0 are
/// counted here even though the selection grid hides them.
pub fn summarize(devices: &[Device]) -> Vec<TypeSummary> {
    let mut by_type: Vec<(String, Vec<&Device>)> = Vec::new();
    for device in devices {
        match by_type.iter_mut().find(|(t, _)| *t == device.device_type) {
            Some((_, members)) => members.push(device),
            None => by_type.push((device.device_type.clone(), vec![device])),
        }
    }

    by_type
        .into_iter()
        .map(|(device_type, members)| {
            let total = members.len();
            let mut by_status: Vec<(String, Vec<Device>)> = Vec::new();
            for device in members {
                let label = device.status_label();
                match by_status.iter_mut().find(|(s, _)| s == label) {
                    Some((_, group)) => group.push(device.clone()),
                    None => by_status.push((label.to_string(), vec![device.clone()])),
                }
            }
            by_status.sort_by(|(a, _), (b, _)| compare_status(a, b));

            let counts: Vec<usize> = by_status.iter().map(|(_, group)| group.len()).collect();
            let statuses = by_status
                .into_iter()
                .zip(percentages(&counts, total))
                .map(|((status, group), percentage)| {
                    let numbers: Vec<u32> = group.iter().map(|d| d.number).collect();
                    StatusGroup {
                        count: group.len(),
                        percentage,
                        numbers: compress_sequence(&numbers),
                        status,
                        devices: group,
                    }
                })
                .collect();

            TypeSummary {
                device_type,
                total,
                statuses,
            }
        })
        .collect()
}

/// Alphabetical, with the undefined sentinel always last
fn compare_status(a: &str, b: &str) -> Ordering {
    match (a == UNDEFINED_STATUS, b == UNDEFINED_STATUS) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a
            .to_lowercase()
            .cmp(&b.to_lowercase())
            .then_with(|| a.cmp(b)),
    }
}

/// Shares of `total` in tenths of a percent, apportioned by largest remainder.
/// `counts` must add up to `total`.
fn percentages(counts: &[usize], total: usize) -> Vec<f64> {
    if total == 0 {
        return vec![0.0; counts.len()];
    }
    let mut tenths: Vec<usize> = counts.iter().map(|c| c * 1000 / total).collect();
    let mut order: Vec<usize> = (0..counts.len()).collect();
    // Stable sort keeps earlier groups first on equal remainders
    order.sort_by_key(|&i| std::cmp::Reverse(counts[i] * 1000 % total));

    let assigned: usize = tenths.iter().sum();
    for &i in order.iter().take(1000usize.saturating_sub(assigned)) {
        tenths[i] += 1;
    }
    tenths.into_iter().map(|t| t as f64 / 10.0).collect()
}

/// Collapses runs of consecutive numbers: `[1,2,3,5,7,8]` -> `"1-3, 5, 7-8"`
pub fn compress_sequence(numbers: &[u32]) -> String {
    let mut sorted = numbers.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs: Vec<String> = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return String::new();
    };

    let (mut start, mut prev) = (first, first);
    for n in iter {
        if prev.checked_add(1) == Some(n) {
            prev = n;
            continue;
        }
        runs.push(render_run(start, prev));
        start = n;
        prev = n;
    }
    runs.push(render_run(start, prev));

    runs.join(", ")
}

fn render_run(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}

/// Devices offered in the selection grid (number 0 is an unassigned placeholder)
pub fn selectable_devices(devices: &[Device]) -> Vec<Device> {
    devices.iter().filter(|d| d.number != 0).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: i64, device_type: &str, number: u32, status: &str) -> Device {
        Device {
            id,
            device_type: device_type.to_string(),
            number,
            status: status.to_string(),
        }
    }

    #[test]
    fn compress_examples() {
        assert_eq!(compress_sequence(&[]), "");
        assert_eq!(compress_sequence(&[5]), "5");
        assert_eq!(compress_sequence(&[1, 2, 3, 5, 7, 8]), "1-3, 5, 7-8");
        assert_eq!(compress_sequence(&[10, 9, 8]), "8-10");
        assert_eq!(compress_sequence(&[4, 4, 5]), "4-5");
        assert_eq!(compress_sequence(&[u32::MAX - 1, u32::MAX, 0]), format!("0, {}-{}", u32::MAX - 1, u32::MAX));
    }

    #[test]
    fn groups_by_type_then_status() {
        let devices = vec![
            device(1, "PPI", 1, "Conforme"),
            device(2, "PPE", 1, "Conforme"),
            device(3, "PPI", 2, "Conforme"),
            device(4, "PPI", 3, "Dispositivo danificado"),
            device(5, "PPI", 4, ""),
        ];
        let summary = summarize(&devices);

        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].device_type, "PPI");
        assert_eq!(summary[0].total, 4);
        let labels: Vec<&str> = summary[0].statuses.iter().map(|s| s.status.as_str()).collect();
        assert_eq!(labels, vec!["Conforme", "Dispositivo danificado", UNDEFINED_STATUS]);
        assert_eq!(summary[0].statuses[0].numbers, "1-2");
        assert_eq!(summary[0].statuses[0].percentage, 50.0);
        assert_eq!(summary[0].statuses[1].percentage, 25.0);

        assert_eq!(summary[1].device_type, "PPE");
        assert_eq!(summary[1].statuses[0].percentage, 100.0);
    }

    #[test]
    fn undefined_status_sorts_last_even_against_late_letters() {
        let devices = vec![
            device(1, "LUZ", 1, ""),
            device(2, "LUZ", 2, "Zumbido"),
            device(3, "LUZ", 3, "Ativo"),
            device(4, "LUZ", 4, UNDEFINED_STATUS),
        ];
        let summary = summarize(&devices);
        let labels: Vec<&str> = summary[0].statuses.iter().map(|s| s.status.as_str()).collect();
        assert_eq!(labels, vec!["Ativo", "Zumbido", UNDEFINED_STATUS]);
        assert_eq!(summary[0].statuses[2].count, 2);
    }

    #[test]
    fn counts_and_percentages_add_up() {
        let statuses = ["Conforme", "Sem Dispositivo", "", "Dispositivo danificado", "Outro"];
        for size in 1..40u32 {
            let devices: Vec<Device> = (0..size)
                .map(|n| device(i64::from(n), "PPI", n, statuses[(n as usize * 7) % statuses.len()]))
                .collect();
            let summary = summarize(&devices);
            let group = &summary[0];

            let count: usize = group.statuses.iter().map(|s| s.count).sum();
            assert_eq!(count, group.total);

            let pct: f64 = group.statuses.iter().map(|s| s.percentage).sum();
            assert!((pct - 100.0).abs() <= 0.1, "size {size}: {pct}");
        }
    }

    #[test]
    fn even_split_still_totals_one_hundred() {
        let statuses = ["A", "B", "C", "D", "E", "F"];
        let devices: Vec<Device> = statuses
            .iter()
            .enumerate()
            .map(|(n, status)| device(n as i64, "PPI", n as u32 + 1, status))
            .collect();
        let group = &summarize(&devices)[0];

        let shares: Vec<f64> = group.statuses.iter().map(|s| s.percentage).collect();
        assert_eq!(shares, vec![16.7, 16.7, 16.7, 16.7, 16.6, 16.6]);
        let pct: f64 = shares.iter().sum();
        assert!((pct - 100.0).abs() <= 0.1, "{pct}");
    }

    #[test]
    fn thirds_round_toward_the_first_groups() {
        assert_eq!(percentages(&[1, 1, 1], 3), vec![33.4, 33.3, 33.3]);
        assert_eq!(percentages(&[2, 1], 3), vec![66.7, 33.3]);
        assert_eq!(percentages(&[1, 3], 4), vec![25.0, 75.0]);
    }

    #[test]
    fn zero_numbered_devices_are_hidden_from_grid_but_summarised() {
        let devices = vec![device(1, "PPI", 0, "Conforme"), device(2, "PPI", 1, "Conforme")];
        assert_eq!(selectable_devices(&devices), vec![devices[1].clone()]);

        let summary = summarize(&devices);
        assert_eq!(summary[0].total, 2);
        assert_eq!(summary[0].statuses[0].numbers, "0-1");
    }

    #[test]
    fn empty_input_has_no_groups() {
        assert!(summarize(&[]).is_empty());
        assert_eq!(percentages(&[0], 0), vec![0.0]);
    }
}
