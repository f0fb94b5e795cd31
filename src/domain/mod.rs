//! Domain entities (spec.md §3): plain data + the invariants that are
//! cheap to check without a database round-trip. Persistence lives in
//! `crate::store`.

pub mod balance;
pub mod campaign;
pub mod money;
pub mod order;
pub mod refill;
pub mod service;
pub mod user;
pub mod video;
pub mod youtube_account;

pub use balance::{BalanceTransaction, BalanceTxKind};
pub use campaign::{BindingStatus, CampaignBinding, FixedCampaign, REQUIRED_ACTIVE_CAMPAIGNS};
pub use order::{Order, OrderEvent, OrderStatus, TrafficStatus};
pub use refill::{OrderRefill, MAX_REFILLS, REFILL_IDEMPOTENCY_WINDOW_SECS, REFILL_SANITY_MULTIPLIER};
pub use service::{CoefficientEntry, CoefficientMode, Service};
pub use user::{Role, User};
pub use video::{ProcessingMode, VideoProcessing, VideoProcessingStatus, VideoType};
pub use youtube_account::{AccountStatus, YouTubeAccount};
