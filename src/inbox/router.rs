use super::InboundMessage;
use crate::store::{ChatRecord, Store, StoreError};
use crate::tenant::{Tenant, TenantRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Trigger { tenant: Tenant, prompt: String },
    Ignore(&'static str),
}

/// Records chat activity, then decides whether `message` starts an agent
/// turn and for which tenant.
pub fn route_message(
    store: &Store,
    registry: &TenantRegistry,
    trigger_prefix: &str,
    message: &InboundMessage,
) -> Result<RouteDecision, StoreError> {
    if message.chat.trim().is_empty() {
        return Ok(RouteDecision::Ignore("empty chat"));
    }
    store.upsert_chat(&ChatRecord {
        chat_id: message.chat.clone(),
        name: String::new(),
        last_activity: message.timestamp,
    })?;

    let Some(tenant) = registry.by_chat(&message.chat)? else {
        return Ok(RouteDecision::Ignore("unregistered chat"));
    };
    if message.text.trim().is_empty() {
        return Ok(RouteDecision::Ignore("empty message"));
    }
    if !tenant.is_privileged && !has_trigger(&message.text, trigger_prefix) {
        return Ok(RouteDecision::Ignore("missing trigger"));
    }

    let prompt = format_prompt(message);
    Ok(RouteDecision::Trigger { tenant, prompt })
}

/// Case-insensitive prefix match that must end on a word boundary, so
/// `@Andy` does not fire on `@Andrew`.
pub fn has_trigger(text: &str, trigger_prefix: &str) -> bool {
    let text = text.trim_start();
    let prefix_len = trigger_prefix.len();
    if prefix_len == 0 || text.len() < prefix_len || !text.is_char_boundary(prefix_len) {
        return false;
    }
    if !text[..prefix_len].eq_ignore_ascii_case(trigger_prefix) {
        return false;
    }
    match text[prefix_len..].chars().next() {
        None => true,
        Some(next) => !(next.is_alphanumeric() || next == '_'),
    }
}

fn format_prompt(message: &InboundMessage) -> String {
    let sender = if message.sender_name.trim().is_empty() {
        message.sender.trim()
    } else {
        message.sender_name.trim()
    };
    format!("{sender}: {}", message.text.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::TenantId;
    use tempfile::tempdir;

    fn message(chat: &str, text: &str) -> InboundMessage {
        InboundMessage {
            chat: chat.to_string(),
            sender: "4915100@s.whatsapp.net".to_string(),
            sender_name: "Dana".to_string(),
            text: text.to_string(),
            timestamp: 1_700_000_000,
            message_id: "m1".to_string(),
        }
    }

    #[test]
    fn trigger_requires_word_boundary() {
        assert!(has_trigger("@Andy what's up", "@Andy"));
        assert!(has_trigger("  @andy", "@Andy"));
        assert!(has_trigger("@ANDY, hi", "@Andy"));
        assert!(!has_trigger("@Andrew hi", "@Andy"));
        assert!(!has_trigger("@Andy_bot hi", "@Andy"));
        assert!(!has_trigger("hello @Andy", "@Andy"));
        assert!(!has_trigger("@An", "@Andy"));
    }

    #[test]
    fn routing_honours_registration_and_trigger() {
        let dir = tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("db.sqlite")).expect("store");
        let main = TenantId::parse("main").expect("id");
        let registry = TenantRegistry::new(store.clone(), main.clone());
        registry.register(&main, "Main", "main-chat", 1).expect("main");
        registry
            .register(&TenantId::parse("family").expect("id"), "Family", "family-chat", 1)
            .expect("family");

        let unknown = route_message(&store, &registry, "@Andy", &message("other", "@Andy hi"))
            .expect("route");
        assert_eq!(unknown, RouteDecision::Ignore("unregistered chat"));

        let untriggered =
            route_message(&store, &registry, "@Andy", &message("family-chat", "just chatting"))
                .expect("route");
        assert_eq!(untriggered, RouteDecision::Ignore("missing trigger"));

        match route_message(&store, &registry, "@Andy", &message("main-chat", "status?"))
            .expect("route")
        {
            RouteDecision::Trigger { tenant, prompt } => {
                assert!(tenant.is_privileged);
                assert_eq!(prompt, "Dana: status?");
            }
            other => panic!("unexpected decision: {other:?}"),
        }

        let chats = store.list_chats().expect("chats");
        assert!(chats.iter().any(|chat| chat.chat_id == "other"));
        assert!(chats.iter().all(|chat| chat.last_activity == 1_700_000_000));
    }
}
