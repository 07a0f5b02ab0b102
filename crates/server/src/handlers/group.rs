//! Group coordination handlers: FindCoordinator, JoinGroup, SyncGroup,
//! Heartbeat, LeaveGroup, DescribeGroups, ListGroups.

use std::sync::Arc;

use broker_core::ErrorCode;
use protocol::messages::{
    DescribeGroupsRequest, DescribeGroupsResponse, DescribedGroup, FindCoordinatorRequest,
    FindCoordinatorResponse, HeartbeatRequest, HeartbeatResponse, JoinGroupRequest,
    JoinGroupResponse, LeaveGroupRequest, LeaveGroupResponse, ListGroupsResponse,
    SyncGroupRequest, SyncGroupResponse, COORDINATOR_TYPE_TRANSACTION,
};

use crate::BrokerContext;

pub async fn find_coordinator(
    ctx: &Arc<BrokerContext>,
    request: FindCoordinatorRequest,
) -> FindCoordinatorResponse {
    let broker = if request.key_type == COORDINATOR_TYPE_TRANSACTION {
        ctx.cluster.controller_id()
    } else {
        ctx.groups.coordinator_broker(&request.key)
    };
    let Some(broker) = broker else {
        return FindCoordinatorResponse::error(ErrorCode::CoordinatorNotAvailable.code());
    };
    let addr = ctx.cluster.read(|state| state.broker_addr(broker).cloned());
    match addr {
        Some(info) => FindCoordinatorResponse {
            throttle_time_ms: 0,
            error_code: ErrorCode::None.code(),
            error_message: None,
            node_id: broker,
            host: info.host,
            port: info.port,
        },
        None => FindCoordinatorResponse::error(ErrorCode::CoordinatorNotAvailable.code()),
    }
}

pub async fn join_group(
    ctx: &Arc<BrokerContext>,
    request: JoinGroupRequest,
    client_id: String,
    client_host: String,
) -> JoinGroupResponse {
    let member_id = request.member_id.clone();
    match ctx.groups.join_group(request, client_id, client_host).await {
        Ok(response) => response,
        Err(err) => JoinGroupResponse::error(err.error_code().code(), member_id),
    }
}

pub async fn sync_group(ctx: &Arc<BrokerContext>, request: SyncGroupRequest) -> SyncGroupResponse {
    match ctx.groups.sync_group(request).await {
        Ok(response) => response,
        Err(err) => SyncGroupResponse::error(err.error_code().code()),
    }
}

pub async fn heartbeat(ctx: &Arc<BrokerContext>, request: HeartbeatRequest) -> HeartbeatResponse {
    let code = match ctx
        .groups
        .heartbeat(&request.group_id, request.generation_id, &request.member_id)
        .await
    {
        Ok(code) => code,
        Err(err) => err.error_code(),
    };
    HeartbeatResponse {
        throttle_time_ms: 0,
        error_code: code.code(),
    }
}

pub async fn leave_group(
    ctx: &Arc<BrokerContext>,
    request: LeaveGroupRequest,
) -> LeaveGroupResponse {
    let code = match ctx
        .groups
        .leave_group(&request.group_id, &request.member_id)
        .await
    {
        Ok(code) => code,
        Err(err) => err.error_code(),
    };
    LeaveGroupResponse {
        throttle_time_ms: 0,
        error_code: code.code(),
    }
}

pub async fn describe_groups(
    ctx: &Arc<BrokerContext>,
    request: DescribeGroupsRequest,
) -> DescribeGroupsResponse {
    let mut groups = Vec::with_capacity(request.groups.len());
    for group_id in request.groups {
        match ctx.groups.describe_group(&group_id).await {
            Ok(group) => groups.push(group),
            Err(err) => groups.push(DescribedGroup {
                error_code: err.error_code().code(),
                group_id,
                group_state: String::new(),
                protocol_type: String::new(),
                protocol_data: String::new(),
                members: Vec::new(),
            }),
        }
    }
    DescribeGroupsResponse {
        throttle_time_ms: 0,
        groups,
    }
}

pub async fn list_groups(ctx: &Arc<BrokerContext>) -> ListGroupsResponse {
    ListGroupsResponse {
        throttle_time_ms: 0,
        error_code: ErrorCode::None.code(),
        groups: ctx.groups.list_groups(),
    }
}
