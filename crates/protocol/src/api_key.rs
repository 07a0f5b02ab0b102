//! API keys and the version ranges this broker serves.

use crate::error::{ProtocolError, Result};

/// The request APIs this broker understands. Values are fixed by the Kafka
/// protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum ApiKey {
    Produce = 0,
    Fetch = 1,
    ListOffsets = 2,
    Metadata = 3,
    OffsetCommit = 8,
    OffsetFetch = 9,
    FindCoordinator = 10,
    JoinGroup = 11,
    Heartbeat = 12,
    LeaveGroup = 13,
    SyncGroup = 14,
    DescribeGroups = 15,
    ListGroups = 16,
    SaslHandshake = 17,
    ApiVersions = 18,
    CreateTopics = 19,
    DeleteTopics = 20,
    DeleteRecords = 21,
    InitProducerId = 22,
    AddPartitionsToTxn = 24,
    AddOffsetsToTxn = 25,
    EndTxn = 26,
    WriteTxnMarkers = 27,
    TxnOffsetCommit = 28,
    DescribeConfigs = 32,
    AlterConfigs = 33,
    SaslAuthenticate = 36,
}

/// Every API key, in the order advertised by `ApiVersions`.
pub const ALL_APIS: &[ApiKey] = &[
    ApiKey::Produce,
    ApiKey::Fetch,
    ApiKey::ListOffsets,
    ApiKey::Metadata,
    ApiKey::OffsetCommit,
    ApiKey::OffsetFetch,
    ApiKey::FindCoordinator,
    ApiKey::JoinGroup,
    ApiKey::Heartbeat,
    ApiKey::LeaveGroup,
    ApiKey::SyncGroup,
    ApiKey::DescribeGroups,
    ApiKey::ListGroups,
    ApiKey::SaslHandshake,
    ApiKey::ApiVersions,
    ApiKey::CreateTopics,
    ApiKey::DeleteTopics,
    ApiKey::DeleteRecords,
    ApiKey::InitProducerId,
    ApiKey::AddPartitionsToTxn,
    ApiKey::AddOffsetsToTxn,
    ApiKey::EndTxn,
    ApiKey::WriteTxnMarkers,
    ApiKey::TxnOffsetCommit,
    ApiKey::DescribeConfigs,
    ApiKey::AlterConfigs,
    ApiKey::SaslAuthenticate,
];

impl ApiKey {
    pub fn from_i16(v: i16) -> Result<Self> {
        let key = match v {
            0 => Self::Produce,
            1 => Self::Fetch,
            2 => Self::ListOffsets,
            3 => Self::Metadata,
            8 => Self::OffsetCommit,
            9 => Self::OffsetFetch,
            10 => Self::FindCoordinator,
            11 => Self::JoinGroup,
            12 => Self::Heartbeat,
            13 => Self::LeaveGroup,
            14 => Self::SyncGroup,
            15 => Self::DescribeGroups,
            16 => Self::ListGroups,
            17 => Self::SaslHandshake,
            18 => Self::ApiVersions,
            19 => Self::CreateTopics,
            20 => Self::DeleteTopics,
            21 => Self::DeleteRecords,
            22 => Self::InitProducerId,
            24 => Self::AddPartitionsToTxn,
            25 => Self::AddOffsetsToTxn,
            26 => Self::EndTxn,
            27 => Self::WriteTxnMarkers,
            28 => Self::TxnOffsetCommit,
            32 => Self::DescribeConfigs,
            33 => Self::AlterConfigs,
            36 => Self::SaslAuthenticate,
            other => return Err(ProtocolError::UnknownApiKey(other)),
        };
        Ok(key)
    }

    pub fn code(self) -> i16 {
        self as i16
    }

    /// The inclusive version range served for this API. All served versions
    /// use non-flexible (pre-tagged-field) encodings.
    pub fn version_range(self) -> (i16, i16) {
        match self {
            Self::Produce => (3, 5),
            Self::Fetch => (4, 6),
            Self::ListOffsets => (1, 2),
            Self::Metadata => (0, 5),
            Self::OffsetCommit => (2, 3),
            Self::OffsetFetch => (1, 3),
            Self::FindCoordinator => (0, 1),
            Self::JoinGroup => (0, 2),
            Self::Heartbeat => (0, 2),
            Self::LeaveGroup => (0, 2),
            Self::SyncGroup => (0, 2),
            Self::DescribeGroups => (0, 1),
            Self::ListGroups => (0, 1),
            Self::SaslHandshake => (0, 1),
            Self::ApiVersions => (0, 2),
            Self::CreateTopics => (0, 2),
            Self::DeleteTopics => (0, 1),
            Self::DeleteRecords => (0, 1),
            Self::InitProducerId => (0, 1),
            Self::AddPartitionsToTxn => (0, 1),
            Self::AddOffsetsToTxn => (0, 1),
            Self::EndTxn => (0, 1),
            Self::WriteTxnMarkers => (0, 0),
            Self::TxnOffsetCommit => (0, 2),
            Self::DescribeConfigs => (0, 0),
            Self::AlterConfigs => (0, 0),
            Self::SaslAuthenticate => (0, 1),
        }
    }

    pub fn supports(self, version: i16) -> bool {
        let (min, max) = self.version_range();
        (min..=max).contains(&version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_keys() {
        for &api in ALL_APIS {
            assert_eq!(ApiKey::from_i16(api.code()).unwrap(), api);
        }
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(matches!(
            ApiKey::from_i16(99),
            Err(ProtocolError::UnknownApiKey(99))
        ));
    }

    #[test]
    fn test_version_bounds() {
        assert!(ApiKey::Produce.supports(3));
        assert!(ApiKey::Produce.supports(5));
        assert!(!ApiKey::Produce.supports(2));
        assert!(!ApiKey::Produce.supports(6));
        assert!(ApiKey::ApiVersions.supports(0));
    }
}
