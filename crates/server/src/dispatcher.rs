//! Request dispatch: header decode, version negotiation, per-API routing,
//! response framing.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use broker_core::ErrorCode;
use protocol::messages::*;
use protocol::{ApiKey, RequestHeader};

use crate::handlers;
use crate::BrokerContext;

/// What the connection should do with a finished request.
pub enum Outcome {
    Respond(Bytes),
    /// The request owes no response (acks=0 produce).
    NoResponse,
    /// Protocol violation; the connection must close.
    Close,
}

fn respond(correlation_id: i32, encode: impl FnOnce(&mut BytesMut)) -> Outcome {
    let mut buf = BytesMut::new();
    buf.put_i32(correlation_id);
    encode(&mut buf);
    Outcome::Respond(buf.freeze())
}

pub async fn dispatch(
    ctx: &Arc<BrokerContext>,
    frame: Bytes,
    client_host: String,
    cancel: CancellationToken,
) -> Outcome {
    // The first three header fields are fixed across every header
    // version, so version negotiation happens before touching client_id
    // (whose encoding differs in newer headers).
    use protocol::wire::ReadExt;
    let mut buf = frame;
    let (api_key, version, correlation_id) = match (|| {
        Ok::<_, protocol::ProtocolError>((
            buf.read_i16("api_key")?,
            buf.read_i16("api_version")?,
            buf.read_i32("correlation_id")?,
        ))
    })() {
        Ok(fields) => fields,
        Err(err) => {
            telemetry::metrics().protocol_errors.inc();
            warn!(error = %err, "Malformed request header");
            return Outcome::Close;
        }
    };

    let api = match ApiKey::from_i16(api_key) {
        Ok(api) => api,
        Err(err) => {
            telemetry::metrics().protocol_errors.inc();
            warn!(error = %err, correlation_id, "Unknown api key");
            return Outcome::Close;
        }
    };
    if !api.supports(version) {
        telemetry::metrics().protocol_errors.inc();
        if api == ApiKey::ApiVersions {
            // Per the negotiation rules, an out-of-range ApiVersions gets a
            // v0 response carrying UNSUPPORTED_VERSION plus our ranges.
            let mut response = ApiVersionsResponse::supported();
            response.error_code = ErrorCode::UnsupportedVersion.code();
            return respond(correlation_id, |b| response.encode(b, 0));
        }
        warn!(api = ?api, version, correlation_id, "Unsupported api version");
        return Outcome::Close;
    }

    let client_id = match buf.read_nullable_string("client_id") {
        Ok(client_id) => client_id,
        Err(err) => {
            telemetry::metrics().protocol_errors.inc();
            warn!(error = %err, correlation_id, "Malformed client id");
            return Outcome::Close;
        }
    };
    let header = RequestHeader {
        api_key,
        api_version: version,
        correlation_id,
        client_id,
    };

    macro_rules! decode {
        ($ty:ty) => {
            match <$ty>::decode(&mut buf, version) {
                Ok(request) => request,
                Err(err) => {
                    telemetry::metrics().protocol_errors.inc();
                    warn!(api = ?api, error = %err, "Malformed request body");
                    return Outcome::Close;
                }
            }
        };
    }

    debug!(api = ?api, version, correlation_id, client_id = ?header.client_id, "Dispatching request");

    match api {
        ApiKey::ApiVersions => {
            let _ = decode!(ApiVersionsRequest);
            let response = ApiVersionsResponse::supported();
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::Metadata => {
            let request = decode!(MetadataRequest);
            let response = handlers::metadata::handle(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::Produce => {
            let request = decode!(ProduceRequest);
            let acks = request.acks;
            let response = handlers::produce::handle(ctx, request, &cancel).await;
            if acks == 0 {
                Outcome::NoResponse
            } else {
                respond(correlation_id, |b| response.encode(b, version))
            }
        }
        ApiKey::Fetch => {
            let request = decode!(FetchRequest);
            let response = handlers::fetch::handle(ctx, request, &cancel).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::ListOffsets => {
            let request = decode!(ListOffsetsRequest);
            let response = handlers::list_offsets::handle(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::FindCoordinator => {
            let request = decode!(FindCoordinatorRequest);
            let response = handlers::group::find_coordinator(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::JoinGroup => {
            let request = decode!(JoinGroupRequest);
            let client_id = header.client_id.clone().unwrap_or_default();
            let response =
                handlers::group::join_group(ctx, request, client_id, client_host).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::SyncGroup => {
            let request = decode!(SyncGroupRequest);
            let response = handlers::group::sync_group(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::Heartbeat => {
            let request = decode!(HeartbeatRequest);
            let response = handlers::group::heartbeat(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::LeaveGroup => {
            let request = decode!(LeaveGroupRequest);
            let response = handlers::group::leave_group(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::DescribeGroups => {
            let request = decode!(DescribeGroupsRequest);
            let response = handlers::group::describe_groups(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::ListGroups => {
            let _ = decode!(ListGroupsRequest);
            let response = handlers::group::list_groups(ctx).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::OffsetCommit => {
            let request = decode!(OffsetCommitRequest);
            let response = handlers::offsets::commit(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::OffsetFetch => {
            let request = decode!(OffsetFetchRequest);
            let response = handlers::offsets::fetch(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::CreateTopics => {
            let request = decode!(CreateTopicsRequest);
            let response = handlers::admin::create_topics(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::DeleteTopics => {
            let request = decode!(DeleteTopicsRequest);
            let response = handlers::admin::delete_topics(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::DescribeConfigs => {
            let request = decode!(DescribeConfigsRequest);
            let response = handlers::admin::describe_configs(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::AlterConfigs => {
            let request = decode!(AlterConfigsRequest);
            let response = handlers::admin::alter_configs(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::DeleteRecords => {
            let request = decode!(DeleteRecordsRequest);
            let response = handlers::admin::delete_records(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::InitProducerId => {
            let request = decode!(InitProducerIdRequest);
            let response = handlers::txn::init_producer_id(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::AddPartitionsToTxn => {
            let request = decode!(AddPartitionsToTxnRequest);
            let response = handlers::txn::add_partitions(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::AddOffsetsToTxn => {
            let request = decode!(AddOffsetsToTxnRequest);
            let response = handlers::txn::add_offsets(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::EndTxn => {
            let request = decode!(EndTxnRequest);
            let response = handlers::txn::end_txn(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::WriteTxnMarkers => {
            let request = decode!(WriteTxnMarkersRequest);
            let response = handlers::txn::write_txn_markers(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::TxnOffsetCommit => {
            let request = decode!(TxnOffsetCommitRequest);
            let response = handlers::txn::txn_offset_commit(ctx, request).await;
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::SaslHandshake => {
            let request = decode!(SaslHandshakeRequest);
            let response = handlers::sasl::handshake(request);
            respond(correlation_id, |b| response.encode(b, version))
        }
        ApiKey::SaslAuthenticate => {
            let request = decode!(SaslAuthenticateRequest);
            let response = handlers::sasl::authenticate(ctx, request);
            respond(correlation_id, |b| response.encode(b, version))
        }
    }
}
