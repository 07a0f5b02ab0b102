//! Group membership APIs: JoinGroup (11), SyncGroup (14), Heartbeat (12),
//! LeaveGroup (13), DescribeGroups (15), ListGroups (16).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::wire::{ReadExt, WriteExt};

#[derive(Debug, Clone)]
pub struct JoinGroupProtocol {
    pub name: String,
    pub metadata: Bytes,
}

#[derive(Debug, Clone)]
pub struct JoinGroupRequest {
    pub group_id: String,
    pub session_timeout_ms: i32,
    pub rebalance_timeout_ms: i32,
    pub member_id: String,
    pub protocol_type: String,
    pub protocols: Vec<JoinGroupProtocol>,
}

impl JoinGroupRequest {
    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let group_id = buf.read_string("group_id")?;
        let session_timeout_ms = buf.read_i32("session_timeout_ms")?;
        let rebalance_timeout_ms = if version >= 1 {
            buf.read_i32("rebalance_timeout_ms")?
        } else {
            session_timeout_ms
        };
        Ok(Self {
            group_id,
            session_timeout_ms,
            rebalance_timeout_ms,
            member_id: buf.read_string("member_id")?,
            protocol_type: buf.read_string("protocol_type")?,
            protocols: buf.read_array("protocols", |b| {
                Ok(JoinGroupProtocol {
                    name: b.read_string("protocol_name")?,
                    metadata: b.read_bytes("protocol_metadata")?,
                })
            })?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        buf.put_string(&self.group_id);
        buf.put_i32(self.session_timeout_ms);
        if version >= 1 {
            buf.put_i32(self.rebalance_timeout_ms);
        }
        buf.put_string(&self.member_id);
        buf.put_string(&self.protocol_type);
        buf.put_array(&self.protocols, |b, p| {
            b.put_string(&p.name);
            b.put_bytes_block(&p.metadata);
        });
    }
}

#[derive(Debug, Clone)]
pub struct JoinGroupMember {
    pub member_id: String,
    pub metadata: Bytes,
}

#[derive(Debug, Clone)]
pub struct JoinGroupResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub generation_id: i32,
    pub protocol_name: String,
    pub leader: String,
    pub member_id: String,
    /// Populated only in the response sent to the group leader.
    pub members: Vec<JoinGroupMember>,
}

impl JoinGroupResponse {
    pub fn error(error_code: i16, member_id: String) -> Self {
        Self {
            throttle_time_ms: 0,
            error_code,
            generation_id: -1,
            protocol_name: String::new(),
            leader: String::new(),
            member_id,
            members: Vec::new(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        if version >= 2 {
            buf.put_i32(self.throttle_time_ms);
        }
        buf.put_i16(self.error_code);
        buf.put_i32(self.generation_id);
        buf.put_string(&self.protocol_name);
        buf.put_string(&self.leader);
        buf.put_string(&self.member_id);
        buf.put_array(&self.members, |b, m| {
            b.put_string(&m.member_id);
            b.put_bytes_block(&m.metadata);
        });
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let throttle_time_ms = if version >= 2 {
            buf.read_i32("throttle_time_ms")?
        } else {
            0
        };
        Ok(Self {
            throttle_time_ms,
            error_code: buf.read_i16("error_code")?,
            generation_id: buf.read_i32("generation_id")?,
            protocol_name: buf.read_string("protocol_name")?,
            leader: buf.read_string("leader")?,
            member_id: buf.read_string("member_id")?,
            members: buf.read_array("members", |b| {
                Ok(JoinGroupMember {
                    member_id: b.read_string("member_id")?,
                    metadata: b.read_bytes("metadata")?,
                })
            })?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncGroupAssignment {
    pub member_id: String,
    pub assignment: Bytes,
}

#[derive(Debug, Clone)]
pub struct SyncGroupRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    /// Non-empty only from the group leader.
    pub assignments: Vec<SyncGroupAssignment>,
}

impl SyncGroupRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            group_id: buf.read_string("group_id")?,
            generation_id: buf.read_i32("generation_id")?,
            member_id: buf.read_string("member_id")?,
            assignments: buf.read_array("assignments", |b| {
                Ok(SyncGroupAssignment {
                    member_id: b.read_string("member_id")?,
                    assignment: b.read_bytes("assignment")?,
                })
            })?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_string(&self.group_id);
        buf.put_i32(self.generation_id);
        buf.put_string(&self.member_id);
        buf.put_array(&self.assignments, |b, a| {
            b.put_string(&a.member_id);
            b.put_bytes_block(&a.assignment);
        });
    }
}

#[derive(Debug, Clone)]
pub struct SyncGroupResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub assignment: Bytes,
}

impl SyncGroupResponse {
    pub fn error(error_code: i16) -> Self {
        Self {
            throttle_time_ms: 0,
            error_code,
            assignment: Bytes::new(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        if version >= 1 {
            buf.put_i32(self.throttle_time_ms);
        }
        buf.put_i16(self.error_code);
        buf.put_bytes_block(&self.assignment);
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let throttle_time_ms = if version >= 1 {
            buf.read_i32("throttle_time_ms")?
        } else {
            0
        };
        Ok(Self {
            throttle_time_ms,
            error_code: buf.read_i16("error_code")?,
            assignment: buf.read_bytes("assignment")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
}

impl HeartbeatRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            group_id: buf.read_string("group_id")?,
            generation_id: buf.read_i32("generation_id")?,
            member_id: buf.read_string("member_id")?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_string(&self.group_id);
        buf.put_i32(self.generation_id);
        buf.put_string(&self.member_id);
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
}

impl HeartbeatResponse {
    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        if version >= 1 {
            buf.put_i32(self.throttle_time_ms);
        }
        buf.put_i16(self.error_code);
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let throttle_time_ms = if version >= 1 {
            buf.read_i32("throttle_time_ms")?
        } else {
            0
        };
        Ok(Self {
            throttle_time_ms,
            error_code: buf.read_i16("error_code")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LeaveGroupRequest {
    pub group_id: String,
    pub member_id: String,
}

impl LeaveGroupRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            group_id: buf.read_string("group_id")?,
            member_id: buf.read_string("member_id")?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_string(&self.group_id);
        buf.put_string(&self.member_id);
    }
}

#[derive(Debug, Clone)]
pub struct LeaveGroupResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
}

impl LeaveGroupResponse {
    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        if version >= 1 {
            buf.put_i32(self.throttle_time_ms);
        }
        buf.put_i16(self.error_code);
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let throttle_time_ms = if version >= 1 {
            buf.read_i32("throttle_time_ms")?
        } else {
            0
        };
        Ok(Self {
            throttle_time_ms,
            error_code: buf.read_i16("error_code")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DescribeGroupsRequest {
    pub groups: Vec<String>,
}

impl DescribeGroupsRequest {
    pub fn decode(buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self {
            groups: buf.read_array("groups", |b| b.read_string("group_id"))?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut, _version: i16) {
        buf.put_array(&self.groups, |b, g| b.put_string(g));
    }
}

#[derive(Debug, Clone)]
pub struct DescribedGroupMember {
    pub member_id: String,
    pub client_id: String,
    pub client_host: String,
    pub member_metadata: Bytes,
    pub member_assignment: Bytes,
}

#[derive(Debug, Clone)]
pub struct DescribedGroup {
    pub error_code: i16,
    pub group_id: String,
    pub group_state: String,
    pub protocol_type: String,
    pub protocol_data: String,
    pub members: Vec<DescribedGroupMember>,
}

#[derive(Debug, Clone)]
pub struct DescribeGroupsResponse {
    pub throttle_time_ms: i32,
    pub groups: Vec<DescribedGroup>,
}

impl DescribeGroupsResponse {
    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        if version >= 1 {
            buf.put_i32(self.throttle_time_ms);
        }
        buf.put_array(&self.groups, |b, g| {
            b.put_i16(g.error_code);
            b.put_string(&g.group_id);
            b.put_string(&g.group_state);
            b.put_string(&g.protocol_type);
            b.put_string(&g.protocol_data);
            b.put_array(&g.members, |b, m| {
                b.put_string(&m.member_id);
                b.put_string(&m.client_id);
                b.put_string(&m.client_host);
                b.put_bytes_block(&m.member_metadata);
                b.put_bytes_block(&m.member_assignment);
            });
        });
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let throttle_time_ms = if version >= 1 {
            buf.read_i32("throttle_time_ms")?
        } else {
            0
        };
        Ok(Self {
            throttle_time_ms,
            groups: buf.read_array("groups", |b| {
                Ok(DescribedGroup {
                    error_code: b.read_i16("error_code")?,
                    group_id: b.read_string("group_id")?,
                    group_state: b.read_string("group_state")?,
                    protocol_type: b.read_string("protocol_type")?,
                    protocol_data: b.read_string("protocol_data")?,
                    members: b.read_array("members", |b| {
                        Ok(DescribedGroupMember {
                            member_id: b.read_string("member_id")?,
                            client_id: b.read_string("client_id")?,
                            client_host: b.read_string("client_host")?,
                            member_metadata: b.read_bytes("member_metadata")?,
                            member_assignment: b.read_bytes("member_assignment")?,
                        })
                    })?,
                })
            })?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListGroupsRequest;

impl ListGroupsRequest {
    pub fn decode(_buf: &mut Bytes, _version: i16) -> Result<Self> {
        Ok(Self)
    }

    pub fn encode(&self, _buf: &mut BytesMut, _version: i16) {}
}

#[derive(Debug, Clone)]
pub struct ListedGroup {
    pub group_id: String,
    pub protocol_type: String,
}

#[derive(Debug, Clone)]
pub struct ListGroupsResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub groups: Vec<ListedGroup>,
}

impl ListGroupsResponse {
    pub fn encode(&self, buf: &mut BytesMut, version: i16) {
        if version >= 1 {
            buf.put_i32(self.throttle_time_ms);
        }
        buf.put_i16(self.error_code);
        buf.put_array(&self.groups, |b, g| {
            b.put_string(&g.group_id);
            b.put_string(&g.protocol_type);
        });
    }

    pub fn decode(buf: &mut Bytes, version: i16) -> Result<Self> {
        let throttle_time_ms = if version >= 1 {
            buf.read_i32("throttle_time_ms")?
        } else {
            0
        };
        Ok(Self {
            throttle_time_ms,
            error_code: buf.read_i16("error_code")?,
            groups: buf.read_array("groups", |b| {
                Ok(ListedGroup {
                    group_id: b.read_string("group_id")?,
                    protocol_type: b.read_string("protocol_type")?,
                })
            })?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_group_round_trip() {
        let request = JoinGroupRequest {
            group_id: "g1".into(),
            session_timeout_ms: 10_000,
            rebalance_timeout_ms: 30_000,
            member_id: String::new(),
            protocol_type: "consumer".into(),
            protocols: vec![JoinGroupProtocol {
                name: "range".into(),
                metadata: Bytes::from_static(b"meta"),
            }],
        };
        for version in 0..=2 {
            let mut buf = BytesMut::new();
            request.encode(&mut buf, version);
            let mut b = buf.freeze();
            let decoded = JoinGroupRequest::decode(&mut b, version).unwrap();
            assert!(b.is_empty());
            assert_eq!(decoded.group_id, "g1");
            if version == 0 {
                // v0 has no rebalance timeout; it falls back to the session timeout.
                assert_eq!(decoded.rebalance_timeout_ms, 10_000);
            } else {
                assert_eq!(decoded.rebalance_timeout_ms, 30_000);
            }
        }
    }

    #[test]
    fn test_sync_group_round_trip() {
        let request = SyncGroupRequest {
            group_id: "g1".into(),
            generation_id: 3,
            member_id: "m1".into(),
            assignments: vec![SyncGroupAssignment {
                member_id: "m1".into(),
                assignment: Bytes::from_static(b"assign"),
            }],
        };
        let mut buf = BytesMut::new();
        request.encode(&mut buf, 1);
        let mut b = buf.freeze();
        let decoded = SyncGroupRequest::decode(&mut b, 1).unwrap();
        assert_eq!(decoded.assignments.len(), 1);
    }
}
