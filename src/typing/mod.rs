//! Typing indicators

mod session;

pub use session::{
    TypingCallback, TypingSession, TypingUser, DEFAULT_TYPING_TIMEOUT, TYPING_EVENT,
};
