//! MQTT 3.1.1 wire protocol: control packets and topic semantics

pub mod packet;
pub mod topics;

pub use packet::{
    ConnAck, Connect, ConnectReturnCode, Packet, ProtocolError, Publish, QoS, SubAck, Subscribe,
    Unsubscribe, SUBACK_FAILURE,
};
pub use topics::{matches, validate_topic_filter, validate_topic_name, TopicError};
