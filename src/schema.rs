/// Column-name constants and store keys for the proximity pipeline.
/// Single source of truth - exported to Python via PyO3.

// ── Shared columns ──────────────────────────────────────────────────────────
pub mod common {
    pub const DATETIME: &str = "datetime";
    pub const MEMBER: &str = "member";
    pub const RSSI: &str = "rssi";
}

// ── Member-to-member columns ────────────────────────────────────────────────
pub mod m2m {
    pub const MEMBER1: &str = "member1";
    pub const MEMBER2: &str = "member2";
    pub const RSSI_MAX: &str = "rssi_max";
    pub const COMPANY1: &str = "company1";
    pub const COMPANY2: &str = "company2";
    pub const MINUTES: &str = "minutes";
}

// ── Member-to-badge / member-to-beacon columns ──────────────────────────────
pub mod m2badge {
    pub const OBSERVED_ID: &str = "observed_id";
}

pub mod m2b {
    pub const BEACON: &str = "beacon";
}

// ── Member-to-5-closest-beacons columns ─────────────────────────────────────
pub mod m5cb {
    pub const BEACON_0: &str = "beacon_0";
    pub const RSSI_0: &str = "rssi_0";

    /// Number of ranked beacon slots per row.
    pub const SLOTS: usize = 5;

    /// RSSI written into slots that had no beacon.
    pub const RSSI_MISSING: f64 = -1.0;

    pub fn beacon_slot(i: usize) -> String {
        format!("beacon_{i}")
    }

    pub fn rssi_slot(i: usize) -> String {
        format!("rssi_{i}")
    }
}

// ── Member-to-closest-beacon columns ────────────────────────────────────────
pub mod m1cb {
    pub const BEACON_COMPANY: &str = "beacon_company";
    pub const BEACON_TYPE: &str = "beacon_type";
    pub const MEMBER_COMPANY: &str = "member_company";
    pub const LOCATION_TYPE: &str = "location_type";
    pub const LOCATION_TYPE_NEARBY: &str = "location_type_nearby";
    pub const LOCATION_TYPE_MERGED: &str = "location_type_merged";
}

// ── Compliance columns ──────────────────────────────────────────────────────
pub mod comply {
    pub const COMPLY: &str = "comply";
    pub const MAX_RSSI: &str = "max_rssi";
    pub const COMPLY1: &str = "comply1";
    pub const COMPLY2: &str = "comply2";
}

// ── Metadata columns ────────────────────────────────────────────────────────
pub mod members {
    pub const MEMBER: &str = "member";
    pub const MEMBER_ID: &str = "member_id";
    pub const COMPANY: &str = "company";
    pub const PARTICIPATES: &str = "participates";
    pub const START_DATE: &str = "start_date";
    pub const END_DATE: &str = "end_date";
    pub const START_DATE_TS: &str = "start_date_ts";
    pub const END_DATE_TS: &str = "end_date_ts";
}

pub mod beacons {
    pub const BEACON: &str = "beacon";
    pub const BEACON_ID: &str = "beacon_id";
    pub const COMPANY: &str = "company";
    pub const TYPE: &str = "type";
    pub const NEARBY_COMPANIES: &str = "nearby_companies";
}

// ── Beacon type values ──────────────────────────────────────────────────────
pub mod beacon_type {
    pub const BOARD: &str = "board";
    pub const COMPANY: &str = "company";
}

// ── Location type values ────────────────────────────────────────────────────
pub mod location_type {
    pub const AT_COMPANY: &str = "at company";
    pub const AT_DIFFERENT_COMPANY: &str = "at different company";
    pub const AT_NEARBY_COMPANY: &str = "at nearby company";
    pub const AT_FAR_COMPANY: &str = "at far company";
}

// ── Store keys ──────────────────────────────────────────────────────────────
pub mod keys {
    pub const MEMBER_TO_MEMBER: &str = "proximity/member_to_member";
    pub const MEMBER_TO_BADGE: &str = "proximity/member_to_badge";
    pub const MEMBER_TO_BEACON: &str = "proximity/member_to_beacon";
    pub const MEMBER_5_CLOSEST_BEACONS: &str = "proximity/member_5_closest_beacons";
    pub const MEMBER_CLOSEST_BEACON: &str = "proximity/member_closest_beacon";
    pub const MEMBER_COMPLY: &str = "proximity/member_comply";
    pub const MEMBER_COMPLY_DIRTY: &str = "proximity/member_comply_dirty";
    pub const METADATA_MEMBERS: &str = "metadata/members";

    pub const M2M_COMPLY_FILTERED: &str = "m2m_comply_filtered";
    pub const M2M_DBL: &str = "m2m_dbl";
    pub const M2M_DBL_DAILY: &str = "m2m_dbl_daily";
    pub const M2M_DBL_ANNUAL: &str = "m2m_dbl_annual";
    pub const M2C_DAILY: &str = "m2c_daily";
    pub const M2C_ANNUAL: &str = "m2c_annual";
    pub const C2C_DBL_DAILY: &str = "c2c_dbl_daily";
    pub const C2C_DBL_ANNUAL: &str = "c2c_dbl_annual";

    /// Key of a connections table built with a given RSSI cutoff.
    ///
    /// The sign is dropped since `-` is not allowed in a key segment:
    /// `connections_key(-62, "m2c_daily")` is `proximity/rssi_62/m2c_daily`.
    pub fn connections_key(rssi_cutoff: i32, table: &str) -> String {
        format!("proximity/rssi_{}/{}", rssi_cutoff.unsigned_abs(), table)
    }
}
