//! Question/answer exchange with the interview backend.

pub mod channel;
pub mod coordinator;
pub mod protocol;
pub mod ws;

pub use channel::{AnswerOutcome, ChannelEvent, ExchangeChannel, QuestionDelivery};
pub use coordinator::{wait_connected, ExchangeCoordinator, PendingExchange};
pub use protocol::{parse_server_frame, ClientMessage, ServerMessage};
pub use ws::{ConnectionState, WsExchangeChannel};
