// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Authentication and network helpers for the HTTP channel server.
//!
//! Two schemes: the static gateway token (`X-Gateway-Token`) for admin
//! routes, and device auth (`Authorization: Bearer owk_…` API key or
//! `X-Device-Id` + `X-Device-Token`) for agentic routes.  Unknown devices
//! presenting an id are auto-enrolled as pending and told to pair.

use std::net::IpAddr;

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::{DeviceStore, Scope};

use super::ApiError;

/// Authenticated device (or API-key) identity.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Device id, or the API key id for bearer auth.
    pub id: String,
    pub scope: Scope,
}

/// Normalize a remote address: strip the IPv4-mapped prefix and map the
/// IPv6 loopback to its IPv4 spelling.
pub fn normalize_remote_addr(addr: &str) -> String {
    let stripped = addr.strip_prefix("::ffff:").unwrap_or(addr);
    if stripped == "::1" {
        return "127.0.0.1".to_string();
    }
    stripped.to_string()
}

/// CIDR-aware allowlist check.  An empty allowlist allows everything.
pub fn ip_allowed(remote: IpAddr, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    let remote = match remote {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    };
    allowlist.iter().any(|entry| cidr_contains(entry, remote))
}

fn cidr_contains(entry: &str, addr: IpAddr) -> bool {
    let (net, prefix) = match entry.split_once('/') {
        Some((net, len)) => {
            let Ok(len) = len.parse::<u32>() else {
                return false;
            };
            (net, Some(len))
        }
        None => (entry, None),
    };
    let Ok(net_addr) = net.parse::<IpAddr>() else {
        return false;
    };
    match (net_addr, addr) {
        (IpAddr::V4(n), IpAddr::V4(a)) => {
            let bits = prefix.unwrap_or(32).min(32);
            if bits == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - bits);
            (u32::from(n) & mask) == (u32::from(a) & mask)
        }
        (IpAddr::V6(n), IpAddr::V6(a)) => {
            let bits = prefix.unwrap_or(128).min(128);
            if bits == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - bits);
            (u128::from(n) & mask) == (u128::from(a) & mask)
        }
        _ => false,
    }
}

/// Verify the static gateway token in constant time.
pub fn require_gateway_token(headers: &HeaderMap, token_hash: &str) -> Result<(), ApiError> {
    let provided = headers
        .get("x-gateway-token")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(ApiError::unauthorized)?;
    let provided_hash = hex::encode(Sha256::digest(provided.as_bytes()));
    if provided_hash.len() == token_hash.len()
        && bool::from(provided_hash.as_bytes().ct_eq(token_hash.as_bytes()))
    {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

/// Authenticate a device request.
///
/// Order: `Authorization: Bearer owk_…` API key, then
/// `X-Device-Id` + `X-Device-Token`.  A device id without a valid token is
/// auto-enrolled as pending and rejected with `ERR_DEVICE_NOT_PAIRED`.
pub fn authenticate_device(
    headers: &HeaderMap,
    devices: &DeviceStore,
) -> Result<DeviceIdentity, ApiError> {
    if let Some(bearer) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return match devices.verify_api_key(bearer) {
            Some((id, scope)) => Ok(DeviceIdentity { id, scope }),
            None => Err(ApiError::unauthorized()),
        };
    }

    let device_id = headers
        .get("x-device-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(ApiError::unauthorized)?;
    let token = headers.get("x-device-token").and_then(|v| v.to_str().ok());

    if let Some(token) = token {
        if let Some(device) = devices.verify_device(device_id, token) {
            return Ok(DeviceIdentity {
                id: device.device_id,
                scope: device.scope,
            });
        }
    }

    // Known-revoked devices stay 401 without re-enrollment; everything else
    // lands in the pending queue so the operator can approve it.
    match devices.status(device_id) {
        crate::DeviceStatus::Revoked => Err(ApiError::unauthorized()),
        crate::DeviceStatus::Paired => Err(ApiError::unauthorized()),
        _ => {
            devices.enroll_pending(device_id);
            Err(ApiError::device_not_paired())
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
