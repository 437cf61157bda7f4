// =============================================================================
// Core error taxonomy
// =============================================================================
//
// Transport failures (`Network`) recover locally with backoff. Business
// rejections are surfaced through the journal and Telegram but never retried.
// Notification failures never reach this enum — the notifier swallows them.
// =============================================================================

use thiserror::Error;

/// The error kinds the core reasons about.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("required configuration field blank: {0}")]
    ConfigMissing(String),

    #[error("broker rejected credentials: {0}")]
    AuthFailed(String),

    #[error("certificate activation failed: {0}")]
    CertificateInvalid(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("no holiday calendar for year {0}")]
    CalendarMissing(i32),

    #[error("duplicate signal ignored")]
    DuplicateSignal,

    #[error("outside trading hours")]
    OutsideTradingHours,

    #[error("unrecognized action: {0}")]
    UnrecognizedAction(String),

    #[error("opposite position exists")]
    OppositePositionExists,

    #[error("no position to close")]
    NoPosition,

    #[error("broker error {code}: {message}")]
    BrokerBusiness { code: String, message: String },

    #[error("journal corrupt: {0}")]
    JournalCorrupt(String),
}

impl CoreError {
    /// Only transport-level failures are worth retrying. A business rejection
    /// is a deliberate "no" from the broker.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Operator-facing rejection text, used verbatim in failure notifications.
    pub fn operator_text(&self) -> String {
        match self {
            Self::ConfigMissing(field) => format!("設定缺漏: {field}"),
            Self::AuthFailed(_) => "登入驗證失敗".to_string(),
            Self::CertificateInvalid(_) => "憑證驗證失敗".to_string(),
            Self::Network(_) => "網路連線異常".to_string(),
            Self::CalendarMissing(year) => format!("缺少 {year} 年行事曆"),
            Self::DuplicateSignal => "重複訊號已忽略".to_string(),
            Self::OutsideTradingHours => "非交易時間".to_string(),
            Self::UnrecognizedAction(raw) => format!("無法辨識的動作: {raw}"),
            Self::OppositePositionExists => "已有反向持倉".to_string(),
            Self::NoPosition => "無對應持倉".to_string(),
            Self::BrokerBusiness { message, .. } => message.clone(),
            Self::JournalCorrupt(_) => "交易紀錄檔損毀".to_string(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
