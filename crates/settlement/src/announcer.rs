use async_trait::async_trait;
use dice_domain::{ChatId, DrawResult, IssueId};

/// Outbound notices to the chat. Failures are reported but never abort a draw.
#[async_trait]
pub trait DrawAnnouncer: Send + Sync {
    async fn announce_draw(&self, draw: &DrawResult) -> Result<(), String>;

    async fn announce_issue_opened(
        &self,
        chat_id: ChatId,
        issue_id: &IssueId,
        cycle_minutes: u32,
    ) -> Result<(), String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDrawAnnouncer;

#[async_trait]
impl DrawAnnouncer for NoopDrawAnnouncer {
    async fn announce_draw(&self, _draw: &DrawResult) -> Result<(), String> {
        Ok(())
    }

    async fn announce_issue_opened(
        &self,
        _chat_id: ChatId,
        _issue_id: &IssueId,
        _cycle_minutes: u32,
    ) -> Result<(), String> {
        Ok(())
    }
}
