//! Typed control packets and their body readers/writers.

use std::fmt;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{
    put_binary, put_string, take_binary, take_packet_id, take_string, take_u16, take_u8,
    write_remaining_length, FixedHeader,
};
use crate::{
    CodecError, ConnectReturnCode, EncodeError, PacketId, QoS, SubscribeReturnCode,
    MAX_REMAINING_LENGTH,
};

/// Control packet type numbers.
///
/// Ref: 2.2.1 MQTT Control Packet type
mod control {
    pub const CONNECT: u8 = 1;
    pub const CONNACK: u8 = 2;
    pub const PUBLISH: u8 = 3;
    pub const PUBACK: u8 = 4;
    pub const PUBREC: u8 = 5;
    pub const PUBREL: u8 = 6;
    pub const PUBCOMP: u8 = 7;
    pub const SUBSCRIBE: u8 = 8;
    pub const SUBACK: u8 = 9;
    pub const UNSUBSCRIBE: u8 = 10;
    pub const UNSUBACK: u8 = 11;
    pub const PINGREQ: u8 = 12;
    pub const PINGRESP: u8 = 13;
    pub const DISCONNECT: u8 = 14;
}

/// An MQTT 3.1.1 control packet.
///
/// Acknowledgement packets carry nothing but a packet identifier, so their
/// variants hold the [`PacketId`] directly.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PacketId),
    PubRec(PacketId),
    PubRel(PacketId),
    PubComp(PacketId),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(PacketId),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Control packet name, used as a metrics label.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

/// Connection request.
///
/// Ref: 3.1 CONNECT
#[derive(Clone, Eq, PartialEq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: Duration,
    /// May be empty; the server then assigns an identifier.
    pub client_id: String,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl fmt::Debug for Connect {
    // the password never goes into logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connect")
            .field("protocol_name", &self.protocol_name)
            .field("protocol_level", &self.protocol_level)
            .field("clean_session", &self.clean_session)
            .field("keep_alive", &self.keep_alive)
            .field("client_id", &self.client_id)
            .field("will", &self.will)
            .field("username", &self.username)
            .finish()
    }
}

/// Message the broker publishes on the client's behalf when the connection
/// dies without a DISCONNECT.
///
/// Ref: 3.1.2.5 Will Flag
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Connection acknowledgement.
///
/// Ref: 3.2 CONNACK
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

/// Application message, in either direction.
///
/// The packet identifier is present exactly when the QoS is above 0; both
/// decode and encode enforce that pairing.
///
/// Ref: 3.3 PUBLISH
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<PacketId>,
    pub payload: Bytes,
}

/// Subscription request: one packet identifier, one or more filters.
///
/// Ref: 3.8 SUBSCRIBE
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Subscribe {
    pub packet_id: PacketId,
    pub requests: Vec<SubscribeRequest>,
}

/// A single topic filter plus the QoS the subscriber asks for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubscribeRequest {
    pub filter: String,
    pub qos: QoS,
}

/// Subscription acknowledgement, one return code per requested filter, in
/// request order.
///
/// Ref: 3.9 SUBACK
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubAck {
    pub packet_id: PacketId,
    pub return_codes: Vec<SubscribeReturnCode>,
}

/// Ref: 3.10 UNSUBSCRIBE
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Unsubscribe {
    pub packet_id: PacketId,
    pub filters: Vec<String>,
}

/// Parses a complete packet body. `body` holds exactly the declared
/// remaining length.
pub(crate) fn decode(header: &FixedHeader, mut body: BytesMut) -> Result<Packet, CodecError> {
    let packet = match header.packet_type {
        control::CONNECT => {
            require_flags(header, 0)?;
            Packet::Connect(decode_connect(&mut body)?)
        }
        control::CONNACK => {
            require_flags(header, 0)?;
            Packet::ConnAck(decode_connack(&mut body)?)
        }
        control::PUBLISH => Packet::Publish(decode_publish(header.flags, &mut body)?),
        control::PUBACK => {
            require_flags(header, 0)?;
            Packet::PubAck(take_packet_id(&mut body)?)
        }
        control::PUBREC => {
            require_flags(header, 0)?;
            Packet::PubRec(take_packet_id(&mut body)?)
        }
        control::PUBREL => {
            require_flags(header, 2)?;
            Packet::PubRel(take_packet_id(&mut body)?)
        }
        control::PUBCOMP => {
            require_flags(header, 0)?;
            Packet::PubComp(take_packet_id(&mut body)?)
        }
        control::SUBSCRIBE => {
            require_flags(header, 2)?;
            Packet::Subscribe(decode_subscribe(&mut body)?)
        }
        control::SUBACK => {
            require_flags(header, 0)?;
            Packet::SubAck(decode_suback(&mut body)?)
        }
        control::UNSUBSCRIBE => {
            require_flags(header, 2)?;
            Packet::Unsubscribe(decode_unsubscribe(&mut body)?)
        }
        control::UNSUBACK => {
            require_flags(header, 0)?;
            Packet::UnsubAck(take_packet_id(&mut body)?)
        }
        control::PINGREQ => {
            require_flags(header, 0)?;
            Packet::PingReq
        }
        control::PINGRESP => {
            require_flags(header, 0)?;
            Packet::PingResp
        }
        control::DISCONNECT => {
            require_flags(header, 0)?;
            Packet::Disconnect
        }
        other => return Err(CodecError::UnknownPacketType(other)),
    };

    // A PUBLISH payload takes whatever is left; every other body must be
    // consumed exactly.
    if !body.is_empty() {
        return Err(CodecError::TrailingBytes(body.len()));
    }

    Ok(packet)
}

fn require_flags(header: &FixedHeader, expected: u8) -> Result<(), CodecError> {
    if header.flags == expected {
        Ok(())
    } else {
        Err(CodecError::InvalidFlags {
            packet_type: header.packet_type,
            flags: header.flags,
        })
    }
}

fn decode_connect(body: &mut BytesMut) -> Result<Connect, CodecError> {
    let protocol_name = take_string(body)?;
    if protocol_name != crate::PROTOCOL_NAME && protocol_name != crate::PROTOCOL_NAME_LEGACY {
        return Err(CodecError::MalformedConnect("unrecognized protocol name"));
    }

    // The level is carried through unchecked; the broker refuses anything
    // but 3.1.1 with CONNACK return code 1.
    let protocol_level = take_u8(body)?;

    let flags = take_u8(body)?;
    if flags & 0x01 != 0 {
        return Err(CodecError::MalformedConnect("reserved flag bit is set"));
    }

    let keep_alive = Duration::from_secs(u64::from(take_u16(body)?));
    let client_id = take_string(body)?;
    let clean_session = flags & 0x02 != 0;

    let will = if flags & 0x04 != 0 {
        let topic = take_string(body)?;
        let will_qos = (flags >> 3) & 0x03;
        let qos = QoS::from_u8(will_qos).ok_or(CodecError::InvalidQoS(will_qos))?;
        let payload = take_binary(body)?;
        Some(LastWill {
            topic,
            payload,
            qos,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };

    let username = if flags & 0x80 != 0 {
        Some(take_string(body)?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(take_binary(body)?)
    } else {
        None
    };

    Ok(Connect {
        protocol_name,
        protocol_level,
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

fn decode_connack(body: &mut BytesMut) -> Result<ConnAck, CodecError> {
    let session_present = match take_u8(body)? {
        0 => false,
        1 => true,
        _ => return Err(CodecError::MalformedConnAck),
    };
    let code = take_u8(body)?;
    let return_code = ConnectReturnCode::from_u8(code).ok_or(CodecError::UnknownReturnCode(code))?;

    Ok(ConnAck {
        session_present,
        return_code,
    })
}

fn decode_publish(flags: u8, body: &mut BytesMut) -> Result<Publish, CodecError> {
    let dup = flags & 0x08 != 0;
    let retain = flags & 0x01 != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let qos = QoS::from_u8(qos_bits).ok_or(CodecError::InvalidQoS(qos_bits))?;

    // [MQTT-3.3.1-2] - dup is meaningless without an acknowledgement flow
    if dup && qos == QoS::AtMostOnce {
        return Err(CodecError::DupOnQoS0);
    }

    let topic = take_string(body)?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => Some(take_packet_id(body)?),
    };
    let payload = body.split().freeze();

    Ok(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
    })
}

fn decode_subscribe(body: &mut BytesMut) -> Result<Subscribe, CodecError> {
    let packet_id = take_packet_id(body)?;

    let mut requests = Vec::new();
    while !body.is_empty() {
        let filter = take_string(body)?;
        let requested = take_u8(body)?;
        let qos = QoS::from_u8(requested).ok_or(CodecError::InvalidQoS(requested))?;
        requests.push(SubscribeRequest { filter, qos });
    }

    if requests.is_empty() {
        return Err(CodecError::NoTopics);
    }

    Ok(Subscribe {
        packet_id,
        requests,
    })
}

fn decode_suback(body: &mut BytesMut) -> Result<SubAck, CodecError> {
    let packet_id = take_packet_id(body)?;

    let mut return_codes = Vec::new();
    while !body.is_empty() {
        let code = take_u8(body)?;
        return_codes
            .push(SubscribeReturnCode::from_u8(code).ok_or(CodecError::UnknownReturnCode(code))?);
    }

    if return_codes.is_empty() {
        return Err(CodecError::NoTopics);
    }

    Ok(SubAck {
        packet_id,
        return_codes,
    })
}

fn decode_unsubscribe(body: &mut BytesMut) -> Result<Unsubscribe, CodecError> {
    let packet_id = take_packet_id(body)?;

    let mut filters = Vec::new();
    while !body.is_empty() {
        filters.push(take_string(body)?);
    }

    if filters.is_empty() {
        return Err(CodecError::NoTopics);
    }

    Ok(Unsubscribe { packet_id, filters })
}

/// Writes the complete on-wire form of a packet: header byte, remaining
/// length, body. The body length is computed up front so the frame is
/// written in one pass.
pub(crate) fn encode(packet: &Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
    let body = body_len(packet);
    if body > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLong(body));
    }

    dst.reserve(1 + 4 + body);
    dst.put_u8(first_byte(packet));
    write_remaining_length(body, dst);

    match packet {
        Packet::Connect(connect) => encode_connect(connect, dst)?,
        Packet::ConnAck(connack) => {
            dst.put_u8(connack.session_present as u8);
            dst.put_u8(connack.return_code.into());
        }
        Packet::Publish(publish) => {
            put_string(&publish.topic, dst)?;
            match (publish.qos, publish.packet_id) {
                (QoS::AtMostOnce, _) => (),
                (_, Some(packet_id)) => dst.put_u16(packet_id.get()),
                (_, None) => return Err(EncodeError::MissingPacketId),
            }
            dst.put_slice(&publish.payload);
        }
        Packet::PubAck(id)
        | Packet::PubRec(id)
        | Packet::PubRel(id)
        | Packet::PubComp(id)
        | Packet::UnsubAck(id) => dst.put_u16(id.get()),
        Packet::Subscribe(subscribe) => {
            dst.put_u16(subscribe.packet_id.get());
            for request in &subscribe.requests {
                put_string(&request.filter, dst)?;
                dst.put_u8(request.qos.into());
            }
        }
        Packet::SubAck(suback) => {
            dst.put_u16(suback.packet_id.get());
            for &code in &suback.return_codes {
                dst.put_u8(code.into());
            }
        }
        Packet::Unsubscribe(unsubscribe) => {
            dst.put_u16(unsubscribe.packet_id.get());
            for filter in &unsubscribe.filters {
                put_string(filter, dst)?;
            }
        }
        Packet::PingReq | Packet::PingResp | Packet::Disconnect => (),
    }

    Ok(())
}

fn encode_connect(connect: &Connect, dst: &mut BytesMut) -> Result<(), EncodeError> {
    put_string(&connect.protocol_name, dst)?;
    dst.put_u8(connect.protocol_level);

    let mut flags = 0_u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04 | (u8::from(will.qos) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    dst.put_u8(flags);

    dst.put_u16(connect.keep_alive.as_secs().min(u64::from(u16::max_value())) as u16);
    put_string(&connect.client_id, dst)?;

    if let Some(will) = &connect.will {
        put_string(&will.topic, dst)?;
        put_binary(&will.payload, dst)?;
    }
    if let Some(username) = &connect.username {
        put_string(username, dst)?;
    }
    if let Some(password) = &connect.password {
        put_binary(password, dst)?;
    }

    Ok(())
}

/// Byte length of the variable header plus payload, i.e. the value that
/// goes into the remaining-length field.
pub(crate) fn body_len(packet: &Packet) -> usize {
    match packet {
        Packet::Connect(c) => {
            let mut len = 2 + c.protocol_name.len()  // protocol name
                + 1                                  // protocol level
                + 1                                  // connect flags
                + 2                                  // keep-alive
                + 2 + c.client_id.len();
            if let Some(will) = &c.will {
                len += 2 + will.topic.len() + 2 + will.payload.len();
            }
            if let Some(username) = &c.username {
                len += 2 + username.len();
            }
            if let Some(password) = &c.password {
                len += 2 + password.len();
            }
            len
        }
        Packet::ConnAck(_) => 2,
        Packet::Publish(p) => {
            2 + p.topic.len()
                + if p.qos == QoS::AtMostOnce { 0 } else { 2 }
                + p.payload.len()
        }
        Packet::PubAck(_)
        | Packet::PubRec(_)
        | Packet::PubRel(_)
        | Packet::PubComp(_)
        | Packet::UnsubAck(_) => 2,
        Packet::Subscribe(s) => {
            2 + s.requests.iter().map(|r| 2 + r.filter.len() + 1).sum::<usize>()
        }
        Packet::SubAck(s) => 2 + s.return_codes.len(),
        Packet::Unsubscribe(u) => 2 + u.filters.iter().map(|f| 2 + f.len()).sum::<usize>(),
        Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
    }
}

fn first_byte(packet: &Packet) -> u8 {
    let (packet_type, flags) = match packet {
        Packet::Connect(_) => (control::CONNECT, 0),
        Packet::ConnAck(_) => (control::CONNACK, 0),
        Packet::Publish(publish) => {
            let mut flags = u8::from(publish.qos) << 1;
            if publish.dup {
                flags |= 0x08;
            }
            if publish.retain {
                flags |= 0x01;
            }
            (control::PUBLISH, flags)
        }
        Packet::PubAck(_) => (control::PUBACK, 0),
        Packet::PubRec(_) => (control::PUBREC, 0),
        Packet::PubRel(_) => (control::PUBREL, 2),
        Packet::PubComp(_) => (control::PUBCOMP, 0),
        Packet::Subscribe(_) => (control::SUBSCRIBE, 2),
        Packet::SubAck(_) => (control::SUBACK, 0),
        Packet::Unsubscribe(_) => (control::UNSUBSCRIBE, 2),
        Packet::UnsubAck(_) => (control::UNSUBACK, 0),
        Packet::PingReq => (control::PINGREQ, 0),
        Packet::PingResp => (control::PINGRESP, 0),
        Packet::Disconnect => (control::DISCONNECT, 0),
    };
    (packet_type << 4) | flags
}
