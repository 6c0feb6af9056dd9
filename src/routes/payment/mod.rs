mod handler;
mod model;

pub use handler::create_payment;
pub use model::{CreatePaymentRequest, Payment};
