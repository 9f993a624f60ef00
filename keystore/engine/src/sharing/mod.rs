//! Threshold secret sharing (Shamir over GF(256)).
//!
//! A secret of `L` bytes is split into `N` shares so that any `K` of them
//! reconstruct it and fewer reveal nothing. The field arithmetic comes from
//! `sharks`; this module adds the share layout and its validation.
//!
//! Share layout: `[x][k][y_0 .. y_{L-1}]` where `x` is the share's slot + 1
//! and `k` the threshold. Carrying `k` inside each share lets [`join`]
//! refuse to interpolate from too few points instead of producing a
//! plausible but wrong secret.

use sharks::{Share, Sharks};
use zeroize::Zeroizing;

use crate::error::{EdsError, Result};

/// Raw bytes of one share, header included.
pub type ShareBytes = Vec<u8>;

/// Upper bound on shares: x-coordinates are the non-zero field elements.
pub const MAX_SHARES: usize = 255;

/// Bytes preceding the payload in every share.
pub const HEADER_LEN: usize = 2;

/// Largest quorum the coordinator ever asks for.
const MAX_THRESHOLD: usize = 10;

/// Threshold the coordinator uses for `n` endpoints.
///
/// `min(10, 3 + n / 5)` once there are more than three endpoints, otherwise
/// every share is needed.
pub fn threshold_for(n: usize) -> usize {
    if n > 3 {
        MAX_THRESHOLD.min(3 + n / 5)
    } else {
        n
    }
}

/// Split `secret` into `total` shares, any `threshold` of which recover it.
pub fn split(secret: &[u8], total: usize, threshold: usize) -> Result<Vec<ShareBytes>> {
    if secret.is_empty() {
        return Err(EdsError::Sharing("cannot split an empty secret".into()));
    }
    if threshold < 1 {
        return Err(EdsError::Sharing("threshold must be at least 1".into()));
    }
    if total < threshold {
        return Err(EdsError::Sharing(format!(
            "share count {total} is below threshold {threshold}"
        )));
    }
    if total > MAX_SHARES {
        return Err(EdsError::Sharing(format!(
            "share count {total} exceeds the maximum of {MAX_SHARES}"
        )));
    }

    let dealer = Sharks(threshold as u8).dealer(secret);

    let mut shares = Vec::with_capacity(total);
    for (slot, share) in dealer.take(total).enumerate() {
        // [x][y..] as sharks lays it out
        let raw = Zeroizing::new(Vec::from(&share));
        if raw[0] as usize != slot + 1 {
            return Err(EdsError::Sharing(format!(
                "dealer produced x-coordinate {} for slot {slot}",
                raw[0]
            )));
        }

        let mut bytes = Vec::with_capacity(HEADER_LEN + secret.len());
        bytes.push(raw[0]);
        bytes.push(threshold as u8);
        bytes.extend_from_slice(&raw[1..]);
        shares.push(bytes);
    }

    if shares.len() != total {
        return Err(EdsError::Sharing(format!(
            "dealer produced {} of {total} shares",
            shares.len()
        )));
    }
    Ok(shares)
}

/// Reconstruct a secret from a sparse share array.
///
/// `shares[i]` holds the share written at position `i`, or `None` if it could
/// not be obtained. Only the first `expected_count` slots are considered.
pub fn join(shares: &[Option<ShareBytes>], expected_count: usize) -> Result<Zeroizing<Vec<u8>>> {
    let slots = &shares[..expected_count.min(shares.len())];

    let mut threshold: Option<usize> = None;
    let mut payload_len: Option<usize> = None;
    let mut points: Vec<Share> = Vec::new();

    for (slot, share) in slots.iter().enumerate() {
        let Some(bytes) = share else { continue };

        if bytes.len() <= HEADER_LEN {
            return Err(EdsError::Sharing(format!("share in slot {slot} is truncated")));
        }
        let (x, k, payload) = (bytes[0], bytes[1] as usize, &bytes[HEADER_LEN..]);

        if x as usize != slot + 1 {
            return Err(EdsError::Sharing(format!(
                "share in slot {slot} carries x-coordinate {x}"
            )));
        }
        if k == 0 {
            return Err(EdsError::Sharing(format!("share in slot {slot} has a zero threshold")));
        }

        match threshold {
            None => threshold = Some(k),
            Some(t) if t != k => {
                return Err(EdsError::Sharing(format!(
                    "shares disagree on threshold ({t} vs {k} in slot {slot})"
                )));
            }
            Some(_) => {}
        }
        match payload_len {
            None => payload_len = Some(payload.len()),
            Some(len) if len != payload.len() => {
                return Err(EdsError::Sharing(format!(
                    "shares disagree on length ({len} vs {} in slot {slot})",
                    payload.len()
                )));
            }
            Some(_) => {}
        }

        let mut raw = Zeroizing::new(Vec::with_capacity(1 + payload.len()));
        raw.push(x);
        raw.extend_from_slice(payload);
        let point = Share::try_from(raw.as_slice())
            .map_err(|e| EdsError::Sharing(format!("share in slot {slot} is malformed: {e}")))?;
        points.push(point);
    }

    let Some(k) = threshold else {
        return Err(EdsError::InsufficientShares {
            detail: "no shares present".into(),
            cause: None,
        });
    };
    if points.len() < k {
        return Err(EdsError::InsufficientShares {
            detail: format!("{} of {k} required shares present", points.len()),
            cause: None,
        });
    }

    let secret = Sharks(k as u8)
        .recover(&points[..k])
        .map_err(|e| EdsError::Sharing(format!("share recovery failed: {e}")))?;

    Ok(Zeroizing::new(secret))
}
