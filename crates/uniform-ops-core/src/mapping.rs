//! Hand-maintained legacy → unified status tables, one per entity kind.

use serde::{Deserialize, Serialize};

use crate::status::SplitStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Order,
    PurchaseRequisition,
    PurchaseOrder,
    Shipment,
    GoodsReceipt,
    Invoice,
}

impl EntityKind {
    pub const ALL: [Self; 6] = [
        Self::Order,
        Self::PurchaseRequisition,
        Self::PurchaseOrder,
        Self::Shipment,
        Self::GoodsReceipt,
        Self::Invoice,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::PurchaseRequisition => "purchase_requisition",
            Self::PurchaseOrder => "purchase_order",
            Self::Shipment => "shipment",
            Self::GoodsReceipt => "goods_receipt",
            Self::Invoice => "invoice",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "order" => Some(Self::Order),
            "purchase_requisition" => Some(Self::PurchaseRequisition),
            "purchase_order" => Some(Self::PurchaseOrder),
            "shipment" => Some(Self::Shipment),
            "goods_receipt" => Some(Self::GoodsReceipt),
            "invoice" => Some(Self::Invoice),
            _ => None,
        }
    }

    #[must_use]
    pub fn mapping(self) -> &'static StatusMapping {
        match self {
            Self::Order => &ORDER_MAPPING,
            Self::PurchaseRequisition => &PURCHASE_REQUISITION_MAPPING,
            Self::PurchaseOrder => &PURCHASE_ORDER_MAPPING,
            Self::Shipment => &SHIPMENT_MAPPING,
            Self::GoodsReceipt => &GOODS_RECEIPT_MAPPING,
            Self::Invoice => &INVOICE_MAPPING,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StatusMapping {
    pub entity: EntityKind,
    pub collection: &'static str,
    pub legacy_field: &'static str,
    pub unified_field: &'static str,
    pub table: &'static [(&'static str, &'static str)],
}

impl StatusMapping {
    /// Unified status a record with this legacy status must carry.
    #[must_use]
    pub fn expected_unified(&self, legacy: &str) -> Option<&'static str> {
        self.table
            .iter()
            .find(|(from, _)| *from == legacy)
            .map(|(_, to)| *to)
    }
}

// Split-order labels double as the order table keys so the aggregator and
// the auditor cannot drift apart.
const ORDER_TABLE: &[(&str, &str)] = &[
    (SplitStatus::AwaitingApproval.as_str(), "PENDING_APPROVAL"),
    (SplitStatus::AwaitingFulfilment.as_str(), "IN_FULFILMENT"),
    (SplitStatus::Dispatched.as_str(), "DISPATCHED"),
    (SplitStatus::Delivered.as_str(), "DELIVERED"),
    ("Cancelled", "CANCELLED"),
];

const PURCHASE_REQUISITION_TABLE: &[(&str, &str)] = &[
    ("Draft", "DRAFT"),
    ("Pending Approval", "PENDING_APPROVAL"),
    ("Approved", "APPROVED"),
    ("Rejected", "REJECTED"),
    ("PO Created", "PO_CREATED"),
    ("Partially Fulfilled", "PARTIALLY_FULFILLED"),
    ("Fulfilled", "FULFILLED"),
    ("Cancelled", "CANCELLED"),
];

const PURCHASE_ORDER_TABLE: &[(&str, &str)] = &[
    ("CREATED", "CREATED"),
    ("SENT_TO_VENDOR", "ISSUED"),
    ("ACKNOWLEDGED", "ACKNOWLEDGED"),
    ("IN_FULFILMENT", "IN_FULFILMENT"),
    ("COMPLETED", "CLOSED"),
    ("CANCELLED", "CANCELLED"),
];

const SHIPMENT_TABLE: &[(&str, &str)] = &[
    ("CREATED", "CREATED"),
    ("PICKED_UP", "IN_TRANSIT"),
    ("IN_TRANSIT", "IN_TRANSIT"),
    ("OUT_FOR_DELIVERY", "IN_TRANSIT"),
    ("DELIVERED", "DELIVERED"),
    ("FAILED", "FAILED"),
    ("RETURNED", "RETURNED"),
];

const GOODS_RECEIPT_TABLE: &[(&str, &str)] = &[
    ("DRAFT", "DRAFT"),
    ("RECEIVED", "RECEIVED"),
    ("PARTIALLY_RECEIVED", "PARTIALLY_RECEIVED"),
    ("CONFIRMED", "CONFIRMED"),
];

const INVOICE_TABLE: &[(&str, &str)] = &[
    ("RAISED", "RAISED"),
    ("APPROVED", "APPROVED"),
    ("PAID", "PAID"),
    ("DISPUTED", "DISPUTED"),
    ("CANCELLED", "CANCELLED"),
];

static ORDER_MAPPING: StatusMapping = StatusMapping {
    entity: EntityKind::Order,
    collection: "orders",
    legacy_field: "status",
    unified_field: "unifiedStatus",
    table: ORDER_TABLE,
};

static PURCHASE_REQUISITION_MAPPING: StatusMapping = StatusMapping {
    entity: EntityKind::PurchaseRequisition,
    collection: "purchase_requisitions",
    legacy_field: "status",
    unified_field: "unifiedStatus",
    table: PURCHASE_REQUISITION_TABLE,
};

static PURCHASE_ORDER_MAPPING: StatusMapping = StatusMapping {
    entity: EntityKind::PurchaseOrder,
    collection: "purchase_orders",
    legacy_field: "poStatus",
    unified_field: "unifiedStatus",
    table: PURCHASE_ORDER_TABLE,
};

static SHIPMENT_MAPPING: StatusMapping = StatusMapping {
    entity: EntityKind::Shipment,
    collection: "shipments",
    legacy_field: "shipmentStatus",
    unified_field: "unifiedStatus",
    table: SHIPMENT_TABLE,
};

static GOODS_RECEIPT_MAPPING: StatusMapping = StatusMapping {
    entity: EntityKind::GoodsReceipt,
    collection: "goods_receipts",
    legacy_field: "grnStatus",
    unified_field: "unifiedStatus",
    table: GOODS_RECEIPT_TABLE,
};

static INVOICE_MAPPING: StatusMapping = StatusMapping {
    entity: EntityKind::Invoice,
    collection: "invoices",
    legacy_field: "invoiceStatus",
    unified_field: "unifiedStatus",
    table: INVOICE_TABLE,
};

/// Mapping tables for the requested entity kinds, or all of them when
/// `kinds` is empty.
#[must_use]
pub fn status_mappings(kinds: &[EntityKind]) -> Vec<&'static StatusMapping> {
    if kinds.is_empty() {
        return EntityKind::ALL.iter().map(|kind| kind.mapping()).collect();
    }
    let mut selected: Vec<EntityKind> = kinds.to_vec();
    selected.sort();
    selected.dedup();
    selected.into_iter().map(EntityKind::mapping).collect()
}
