use coap_lite::{MessageClass, MessageType, Packet};

/// Empty message-layer acknowledgement for a Confirmable message we received.
pub(crate) fn new_empty_ack(acknowledging: &Packet) -> Packet {
    let mut ack = Packet::new();
    ack.header.set_type(MessageType::Acknowledgement);
    ack.header.code = MessageClass::Empty;
    ack.header.message_id = acknowledging.header.message_id;
    ack
}

/// Reset message rejecting a peer message, also serving as the "pong" reply to a CoAP ping.
pub(crate) fn new_reset_message(rejecting: &Packet) -> Packet {
    let mut reset = Packet::new();
    reset.header.set_type(MessageType::Reset);
    reset.header.code = MessageClass::Empty;
    reset.header.message_id = rejecting.header.message_id;
    reset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_mirrors_message_id() {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.message_id = 4242;
        let ack = new_empty_ack(&packet);
        assert_eq!(ack.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(ack.header.message_id, 4242);
        assert!(matches!(ack.header.code, MessageClass::Empty));
        assert!(ack.get_token().is_empty());
    }

    #[test]
    fn test_reset_mirrors_message_id() {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.message_id = 7;
        let reset = new_reset_message(&packet);
        assert_eq!(reset.header.get_type(), MessageType::Reset);
        assert_eq!(reset.header.message_id, 7);
    }
}
