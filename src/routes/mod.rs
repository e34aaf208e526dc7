// Route module decomposition — webhook intake, admin surface and system
// endpoints each in their own file; shared request guards live here.

mod admin;
mod system;
mod webhooks;

pub use admin::{
    bot_pause, bot_resume, bot_resume_all, bot_status, followup_activate, followup_deactivate,
    followup_status,
};
pub use system::{health, metrics, not_found};
pub use webhooks::{test_message, webhook_chatwoot, webhook_whatsapp};

use rocket::request::{FromRequest, Outcome, Request};

pub struct ClientIp(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let ip = req
            .headers()
            .get_one("X-Forwarded-For")
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string())
            .or_else(|| req.remote().map(|r| r.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        Outcome::Success(ClientIp(ip))
    }
}
