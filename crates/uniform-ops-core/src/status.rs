//! Composite status for purchase requisitions fanned out into per-vendor
//! split orders.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-split fulfilment status, ordered by progress.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SplitStatus {
    #[serde(rename = "Awaiting approval")]
    AwaitingApproval,
    #[serde(rename = "Awaiting fulfilment")]
    AwaitingFulfilment,
    #[serde(rename = "Dispatched")]
    Dispatched,
    #[serde(rename = "Delivered")]
    Delivered,
}

impl SplitStatus {
    pub const ALL: [Self; 4] = [
        Self::AwaitingApproval,
        Self::AwaitingFulfilment,
        Self::Dispatched,
        Self::Delivered,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingApproval => "Awaiting approval",
            Self::AwaitingFulfilment => "Awaiting fulfilment",
            Self::Dispatched => "Dispatched",
            Self::Delivered => "Delivered",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Awaiting approval" => Some(Self::AwaitingApproval),
            "Awaiting fulfilment" => Some(Self::AwaitingFulfilment),
            "Dispatched" => Some(Self::Dispatched),
            "Delivered" => Some(Self::Delivered),
            _ => None,
        }
    }

    /// Absent and unrecognized labels count as `Awaiting approval`.
    #[must_use]
    pub fn from_label(label: Option<&str>) -> Self {
        label.and_then(Self::parse).unwrap_or(Self::AwaitingApproval)
    }
}

/// Labels produced when two or more splits are aggregated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum CompositeStatus {
    #[serde(rename = "Awaiting approval")]
    AwaitingApproval,
    #[serde(rename = "Awaiting Dispatch")]
    AwaitingDispatch,
    #[serde(rename = "Partially Dispatched")]
    PartiallyDispatched,
    #[serde(rename = "Awaiting Delivery")]
    AwaitingDelivery,
    #[serde(rename = "Partially Delivered")]
    PartiallyDelivered,
    #[serde(rename = "Delivered")]
    Delivered,
}

impl CompositeStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingApproval => "Awaiting approval",
            Self::AwaitingDispatch => "Awaiting Dispatch",
            Self::PartiallyDispatched => "Partially Dispatched",
            Self::AwaitingDelivery => "Awaiting Delivery",
            Self::PartiallyDelivered => "Partially Delivered",
            Self::Delivered => "Delivered",
        }
    }
}

/// Result of [`aggregate_split_status`].
///
/// A single-split requisition reports its split's label untouched, which
/// may be a legacy value outside [`SplitStatus`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AggregateStatus<'a> {
    Single(&'a str),
    Composite(CompositeStatus),
}

impl<'a> AggregateStatus<'a> {
    #[must_use]
    pub fn as_str(&self) -> &'a str {
        match *self {
            Self::Single(label) => label,
            Self::Composite(status) => status.as_str(),
        }
    }
}

impl Display for AggregateStatus<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that exposes a split order's raw status label.
pub trait SplitRecord {
    fn status_label(&self) -> Option<&str>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SplitOrder {
    pub requisition_id: String,
    pub status: Option<String>,
}

impl SplitRecord for SplitOrder {
    fn status_label(&self) -> Option<&str> {
        self.status.as_deref()
    }
}

impl SplitRecord for Value {
    fn status_label(&self) -> Option<&str> {
        self.get("status").and_then(Value::as_str)
    }
}

impl SplitRecord for &str {
    fn status_label(&self) -> Option<&str> {
        Some(*self)
    }
}

/// Computes the display status of a requisition from its split orders.
///
/// Delivery dominates: any delivered split yields `Delivered` or
/// `Partially Delivered` before approval is considered. Otherwise a single
/// unapproved split holds the whole requisition at `Awaiting approval`, and
/// only then are dispatches counted.
#[must_use]
pub fn aggregate_split_status<S: SplitRecord>(splits: &[S]) -> AggregateStatus<'_> {
    let total = splits.len();
    match splits {
        [] => AggregateStatus::Composite(CompositeStatus::AwaitingApproval),
        [only] => AggregateStatus::Single(
            only.status_label()
                .unwrap_or(SplitStatus::AwaitingApproval.as_str()),
        ),
        _ => {
            let mut delivered = 0_usize;
            let mut dispatched = 0_usize;
            let mut awaiting_approval = 0_usize;
            for split in splits {
                match SplitStatus::from_label(split.status_label()) {
                    SplitStatus::Delivered => delivered += 1,
                    SplitStatus::Dispatched => dispatched += 1,
                    SplitStatus::AwaitingApproval => awaiting_approval += 1,
                    SplitStatus::AwaitingFulfilment => {}
                }
            }

            let composite = if delivered > 0 {
                if delivered == total {
                    CompositeStatus::Delivered
                } else {
                    CompositeStatus::PartiallyDelivered
                }
            } else if awaiting_approval > 0 {
                CompositeStatus::AwaitingApproval
            } else if dispatched == 0 {
                CompositeStatus::AwaitingDispatch
            } else if dispatched == total {
                CompositeStatus::AwaitingDelivery
            } else {
                CompositeStatus::PartiallyDispatched
            };
            AggregateStatus::Composite(composite)
        }
    }
}
