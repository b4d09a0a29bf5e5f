use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{Estimate, EstimateOptions, Vote, VoteCollection};

/// Summary statistics for one record. `None` is the "no data" sentinel used
/// when every vote is the unknown card (or there are no votes).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TallySummary {
    pub total_votes: usize,
    pub numeric_count: usize,
    pub average: Option<f64>,
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl TallySummary {
    /// Average rounded to one decimal place for display.
    #[must_use]
    pub fn rounded_average(&self) -> Option<f64> {
        self.average.map(|average| (average * 10.0).round() / 10.0)
    }

    /// Text form of [`Self::rounded_average`], or `-` when there is no data.
    #[must_use]
    pub fn average_label(&self) -> String {
        self.rounded_average().map_or_else(|| "-".to_string(), |average| format!("{average:.1}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RankedVote {
    pub rank: usize,
    pub vote: Vote,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TallyReport {
    pub summary: TallySummary,
    pub rounded_average: Option<f64>,
    pub votes: Vec<RankedVote>,
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn summarize(votes: &VoteCollection) -> TallySummary {
    let numeric = votes.iter().filter_map(|vote| vote.estimate.points()).collect::<Vec<_>>();
    let total_votes = votes.len();

    if numeric.is_empty() {
        return TallySummary { total_votes, numeric_count: 0, average: None, min: None, max: None };
    }

    let sum = numeric.iter().map(|value| i128::from(*value)).sum::<i128>();
    TallySummary {
        total_votes,
        numeric_count: numeric.len(),
        average: Some(sum as f64 / numeric.len() as f64),
        min: numeric.iter().min().copied(),
        max: numeric.iter().max().copied(),
    }
}

/// Position of `estimate` within the configured values. Anything not
/// configured, the unknown card included, falls back to 0.
#[must_use]
pub fn rank_of(estimate: Estimate, options: &EstimateOptions) -> usize {
    match estimate {
        Estimate::Points(value) => {
            options.values.iter().position(|candidate| *candidate == value).unwrap_or(0)
        }
        Estimate::Unknown => 0,
    }
}

/// Total order for the list view: estimate ascending with unknown cards after
/// every numeric estimate, then display name, then participant id.
#[must_use]
pub fn compare_for_display(lhs: &Vote, rhs: &Vote) -> Ordering {
    compare_estimates(lhs.estimate, rhs.estimate)
        .then_with(|| lhs.name.cmp(&rhs.name))
        .then_with(|| lhs.participant_id.cmp(&rhs.participant_id))
}

fn compare_estimates(lhs: Estimate, rhs: Estimate) -> Ordering {
    match (lhs, rhs) {
        (Estimate::Points(lhs), Estimate::Points(rhs)) => lhs.cmp(&rhs),
        (Estimate::Points(_), Estimate::Unknown) => Ordering::Less,
        (Estimate::Unknown, Estimate::Points(_)) => Ordering::Greater,
        (Estimate::Unknown, Estimate::Unknown) => Ordering::Equal,
    }
}

#[must_use]
pub fn order_for_display(votes: &VoteCollection, options: &EstimateOptions) -> Vec<RankedVote> {
    let mut ordered = votes.iter().collect::<Vec<_>>();
    ordered.sort_by(|lhs, rhs| compare_for_display(lhs, rhs));
    ordered
        .into_iter()
        .map(|vote| RankedVote { rank: rank_of(vote.estimate, options), vote: vote.clone() })
        .collect()
}

#[must_use]
pub fn tally_report(votes: &VoteCollection, options: &EstimateOptions) -> TallyReport {
    let summary = summarize(votes);
    TallyReport {
        rounded_average: summary.rounded_average(),
        summary,
        votes: order_for_display(votes, options),
    }
}
