use uuid::Uuid;

pub fn request_id() -> String {
    format!("req-{}", Uuid::new_v4().simple())
}

pub fn tool_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

pub fn message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

pub fn chat_completion_id() -> String {
    let s = Uuid::new_v4().simple().to_string();
    format!("chatcmpl-{}", &s[..s.len().min(24)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes() {
        assert!(tool_call_id().starts_with("call_"));
        assert!(message_id().starts_with("msg_"));
        assert_eq!(chat_completion_id().len(), "chatcmpl-".len() + 24);
        assert_ne!(request_id(), request_id());
    }
}
