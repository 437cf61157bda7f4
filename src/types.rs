// =============================================================================
// Shared types used across the TVBridge gateway
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Which backend a signal, order, or journal entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Market {
    Tx,
    Btc,
}

impl Market {
    /// Uppercase tag used in file names and notification prefixes.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Tx => "TX",
            Self::Btc => "BTC",
        }
    }
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Wire value used by both brokers ("BUY"/"SELL").
    pub fn wire(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire())
    }
}

/// Open/close classification: `New` opens a position, `Cover` closes one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OcType {
    New,
    Cover,
}

impl std::fmt::Display for OcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "New"),
            Self::Cover => write!(f, "Cover"),
        }
    }
}

/// Canonical signal direction after lexicon normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
}

impl Direction {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::OpenLong | Self::OpenShort)
    }

    /// The order side that realizes this direction. Closing a long sells;
    /// closing a short buys.
    pub fn side(&self) -> Side {
        match self {
            Self::OpenLong | Self::CloseShort => Side::Buy,
            Self::OpenShort | Self::CloseLong => Side::Sell,
        }
    }

    pub fn oc(&self) -> OcType {
        if self.is_open() {
            OcType::New
        } else {
            OcType::Cover
        }
    }

    /// The position side this direction opens or closes.
    pub fn position_side(&self) -> Side {
        match self {
            Self::OpenLong | Self::CloseLong => Side::Buy,
            Self::OpenShort | Self::CloseShort => Side::Sell,
        }
    }

    /// Operator-facing label (matches the strategy lexicon).
    pub fn label(&self) -> &'static str {
        match self {
            Self::OpenLong => "開多",
            Self::OpenShort => "開空",
            Self::CloseLong => "平多",
            Self::CloseShort => "平空",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// TX contract family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractFamily {
    Txf,
    Mxf,
    Tmf,
}

impl ContractFamily {
    pub const ALL: [ContractFamily; 3] = [Self::Txf, Self::Mxf, Self::Tmf];

    /// Exchange product code prefix.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Txf => "TXF",
            Self::Mxf => "MXF",
            Self::Tmf => "TMF",
        }
    }

    /// Operator-facing name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Txf => "大台",
            Self::Mxf => "小台",
            Self::Tmf => "微台",
        }
    }

    /// Monetary value of a one-point move, in TWD.
    pub fn point_value(&self) -> f64 {
        match self {
            Self::Txf => 200.0,
            Self::Mxf => 50.0,
            Self::Tmf => 10.0,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_uppercase().as_str() {
            s if s.starts_with("TXF") => Some(Self::Txf),
            s if s.starts_with("MXF") => Some(Self::Mxf),
            s if s.starts_with("TMF") => Some(Self::Tmf),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContractFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Market or limit pricing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceType {
    Market,
    Limit,
}

impl std::fmt::Display for PriceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MKT"),
            Self::Limit => write!(f, "LMT"),
        }
    }
}

/// Order time qualifier: immediate-or-cancel or rest-of-day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimePolicy {
    Ioc,
    Rod,
}

impl std::fmt::Display for TimePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ioc => write!(f, "IOC"),
            Self::Rod => write!(f, "ROD"),
        }
    }
}

/// Lifecycle state of an order. `Submitted` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Submitted,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Submitted)
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submitted => write!(f, "Submitted"),
            Self::Filled => write!(f, "Filled"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Rejected => write!(f, "Rejected"),
            Self::Expired => write!(f, "Expired"),
        }
    }
}

/// A tradeable TX contract for one delivery month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    /// Exchange code, e.g. "TXFG5".
    pub code: String,
    pub family: ContractFamily,
    pub delivery_date: NaiveDate,
    /// Broker role suffix: R1 = current month.
    #[serde(default)]
    pub is_r1: bool,
    /// Broker role suffix: R2 = next month.
    #[serde(default)]
    pub is_r2: bool,
}

impl Contract {
    /// "大台 TXFG5 (2025/07/16)" — the identifier block used in notifications.
    pub fn describe(&self) -> String {
        format!(
            "{} {} ({})",
            self.family.display_name(),
            self.code,
            self.delivery_date.format("%Y/%m/%d")
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_side_and_oc_mapping() {
        assert_eq!(Direction::OpenLong.side(), Side::Buy);
        assert_eq!(Direction::OpenShort.side(), Side::Sell);
        assert_eq!(Direction::CloseLong.side(), Side::Sell);
        assert_eq!(Direction::CloseShort.side(), Side::Buy);

        assert_eq!(Direction::OpenLong.oc(), OcType::New);
        assert_eq!(Direction::CloseShort.oc(), OcType::Cover);

        assert_eq!(Direction::CloseLong.position_side(), Side::Buy);
        assert_eq!(Direction::CloseShort.position_side(), Side::Sell);
    }

    #[test]
    fn family_point_values() {
        assert_eq!(ContractFamily::Txf.point_value(), 200.0);
        assert_eq!(ContractFamily::Mxf.point_value(), 50.0);
        assert_eq!(ContractFamily::Tmf.point_value(), 10.0);
    }

    #[test]
    fn family_from_code() {
        assert_eq!(ContractFamily::from_code("TXFG5"), Some(ContractFamily::Txf));
        assert_eq!(ContractFamily::from_code("mxfh5"), Some(ContractFamily::Mxf));
        assert_eq!(ContractFamily::from_code("ZZZ"), None);
    }

    #[test]
    fn only_submitted_is_non_terminal() {
        assert!(!OrderState::Submitted.is_terminal());
        for s in [
            OrderState::Filled,
            OrderState::Cancelled,
            OrderState::Rejected,
            OrderState::Expired,
        ] {
            assert!(s.is_terminal());
        }
    }
}
