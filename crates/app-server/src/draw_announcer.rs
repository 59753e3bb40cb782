use async_trait::async_trait;
use dice_domain::{ChatId, DrawResult, IssueId, Parity, Size};
use settlement::DrawAnnouncer;
use tracing::info;

fn parity_label(parity: Parity) -> &'static str {
    match parity {
        Parity::Single => "单",
        Parity::Double => "双",
    }
}

fn size_label(size: Size) -> &'static str {
    match size {
        Size::Big => "大",
        Size::Small => "小",
    }
}

/// One history line, e.g. `20240101120000期: 3 3 3  9  单 小 【豹子】`.
#[must_use]
pub fn format_draw_message(draw: &DrawResult) -> String {
    let [a, b, c] = draw.outcome.faces.values();
    let mut line = format!(
        "{}期: {a} {b} {c}  {}  {} {}",
        draw.issue_id,
        draw.outcome.total,
        parity_label(draw.outcome.parity),
        size_label(draw.outcome.size),
    );
    if draw.outcome.triplet {
        line.push_str(" 【豹子】");
    }
    line
}

#[must_use]
pub fn format_issue_opened_message(issue_id: &IssueId, cycle_minutes: u32) -> String {
    format!("第{issue_id}期 {cycle_minutes}分钟后开奖")
}

/// Writes chat announcements to the log. Stands in for the chat transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDrawAnnouncer;

#[async_trait]
impl DrawAnnouncer for TracingDrawAnnouncer {
    async fn announce_draw(&self, draw: &DrawResult) -> Result<(), String> {
        info!(
            chat_id = %draw.chat_id,
            issue_id = %draw.issue_id,
            message = %format_draw_message(draw),
            "draw announced"
        );
        Ok(())
    }

    async fn announce_issue_opened(
        &self,
        chat_id: ChatId,
        issue_id: &IssueId,
        cycle_minutes: u32,
    ) -> Result<(), String> {
        info!(
            chat_id = %chat_id,
            issue_id = %issue_id,
            message = %format_issue_opened_message(issue_id, cycle_minutes),
            "issue announced"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dice_domain::DrawFaces;

    fn draw(faces: [u8; 3]) -> DrawResult {
        DrawResult::new(
            ChatId(-1),
            IssueId::parse("20240101120000").expect("issue"),
            DrawFaces::from_values(faces[0], faces[1], faces[2]).expect("faces"),
            Utc::now(),
        )
    }

    #[test]
    fn triplet_line_is_marked() {
        assert_eq!(
            format_draw_message(&draw([3, 3, 3])),
            "20240101120000期: 3 3 3  9  单 小 【豹子】"
        );
    }

    #[test]
    fn plain_line_has_no_marker() {
        assert_eq!(
            format_draw_message(&draw([4, 5, 6])),
            "20240101120000期: 4 5 6  15  单 大"
        );
        assert_eq!(
            format_draw_message(&draw([2, 3, 5])),
            "20240101120000期: 2 3 5  10  双 小"
        );
    }

    #[test]
    fn issue_opened_notice() {
        let issue = IssueId::parse("20240101120100").expect("issue");
        assert_eq!(
            format_issue_opened_message(&issue, 5),
            "第20240101120100期 5分钟后开奖"
        );
    }
}
