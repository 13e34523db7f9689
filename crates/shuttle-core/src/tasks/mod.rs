//! Built-in tasks.

pub mod welcome_email;

pub use self::welcome_email::{
    EmailError, EmailSender, LoggingEmailSender, WelcomeEmailHandler, WelcomeEmailTask,
};
