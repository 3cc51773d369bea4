use crate::{
    error::ProtocolError,
    types::{BodyComposition, ProtocolVariant, ScaleData, Sex, UserBiometrics, WeightUnit},
    IMPEDANCE_MANUFACTURER_ID, STANDARD_MANUFACTURER_ID,
};
use bytes::Buf;
use std::{collections::HashMap, time::SystemTime};
use uuid::Uuid;

/// Length of a weight-only frame
pub const STANDARD_FRAME_LEN: usize = 5;

/// Length of an extended impedance frame
pub const IMPEDANCE_FRAME_LEN: usize = 13;

/// Flag bit: unit is pounds when set, kilograms when clear
pub const FLAG_UNIT_POUNDS: u8 = 0x01;

/// Flag bit: the reading comes from a settled measurement
///
/// Scales broadcast a stream of transient values while the user steps on,
/// then re-broadcast the settled value with this bit set.
pub const FLAG_STABILIZED: u8 = 0x02;

/// Flag bit: the frame carries a valid impedance field
///
/// Impedance-capable scales set this only on the second, post-stabilization
/// broadcast once the electrode measurement has completed.
pub const FLAG_IMPEDANCE: u8 = 0x04;

/// Pounds per kilogram, used internally by the impedance formulas
const LB_PER_KG: f32 = 2.204_623;

/// Decode a raw characteristic frame into a measurement record
///
/// Pure function: no side effects, no blocking. The frame is validated
/// (length, checksum) before any field is interpreted; a frame that fails
/// validation is rejected whole, never partially decoded.
///
/// Extended body-composition fields are derived only when the variant
/// supports impedance, the frame is a post-stabilization broadcast with a
/// valid impedance field, and `biometrics` were supplied. When biometrics
/// are unavailable the extended fields are omitted entirely rather than
/// computed with defaults.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] on a length or checksum mismatch,
/// or [`ProtocolError::OutOfRange`] when the decoded weight is not
/// strictly positive.
pub fn decode(
    frame: &[u8],
    variant: ProtocolVariant,
    biometrics: Option<&UserBiometrics>,
) -> Result<ScaleData, ProtocolError> {
    match variant {
        ProtocolVariant::Standard => decode_standard(frame),
        ProtocolVariant::Impedance => decode_impedance(frame, biometrics),
    }
}

/// Decode a 5-byte weight-only frame: `[flags, weight_lo, weight_hi, seq, xor]`
fn decode_standard(frame: &[u8]) -> Result<ScaleData, ProtocolError> {
    if frame.len() != STANDARD_FRAME_LEN {
        return Err(ProtocolError::Malformed(format!(
            "standard frame is {} bytes, expected {STANDARD_FRAME_LEN}",
            frame.len()
        )));
    }

    let expected = xor_checksum(&frame[..STANDARD_FRAME_LEN - 1]);
    let actual = frame[STANDARD_FRAME_LEN - 1];
    if expected != actual {
        return Err(ProtocolError::Malformed(format!(
            "checksum mismatch: expected {expected:02X}, got {actual:02X}"
        )));
    }

    let mut buf = &frame[..];
    let flags = buf.get_u8();
    let raw_weight = buf.get_u16_le();

    let (weight, unit) = fixed_point_weight(raw_weight, flags)?;

    Ok(ScaleData {
        weight,
        unit,
        stabilized: flags & FLAG_STABILIZED != 0,
        timestamp: SystemTime::now(),
        composition: None,
    })
}

/// Decode a 13-byte extended frame:
/// `[flags, weight_lo, weight_hi, imp_lo, imp_hi, seq, reserved x6, sum]`
fn decode_impedance(
    frame: &[u8],
    biometrics: Option<&UserBiometrics>,
) -> Result<ScaleData, ProtocolError> {
    if frame.len() != IMPEDANCE_FRAME_LEN {
        return Err(ProtocolError::Malformed(format!(
            "impedance frame is {} bytes, expected {IMPEDANCE_FRAME_LEN}",
            frame.len()
        )));
    }

    let expected = sum_checksum(&frame[..IMPEDANCE_FRAME_LEN - 1]);
    let actual = frame[IMPEDANCE_FRAME_LEN - 1];
    if expected != actual {
        return Err(ProtocolError::Malformed(format!(
            "checksum mismatch: expected {expected:02X}, got {actual:02X}"
        )));
    }

    let mut buf = &frame[..];
    let flags = buf.get_u8();
    let raw_weight = buf.get_u16_le();
    let impedance = buf.get_u16_le();

    let (weight, unit) = fixed_point_weight(raw_weight, flags)?;
    let stabilized = flags & FLAG_STABILIZED != 0;

    // Extended fields only on the post-stabilization impedance broadcast,
    // and only when the caller supplied usable biometrics.
    let composition = if stabilized && flags & FLAG_IMPEDANCE != 0 && impedance > 0 {
        biometrics
            .filter(|b| b.is_plausible())
            .map(|b| derive_composition(weight, unit, impedance, b))
    } else {
        None
    };

    Ok(ScaleData {
        weight,
        unit,
        stabilized,
        timestamp: SystemTime::now(),
        composition,
    })
}

/// Convert the fixed-point frame value to `(weight, unit)`
///
/// Frames carry tenths of a unit: value 700 with the kg flag clear is
/// 70.0 kg. Weight must be strictly positive.
fn fixed_point_weight(raw: u16, flags: u8) -> Result<(f32, WeightUnit), ProtocolError> {
    let unit = if flags & FLAG_UNIT_POUNDS != 0 {
        WeightUnit::Pounds
    } else {
        WeightUnit::Kilograms
    };

    let weight = f32::from(raw) / 10.0;
    if weight <= 0.0 {
        return Err(ProtocolError::OutOfRange(weight));
    }

    Ok((weight, unit))
}

/// Derive body-composition estimates from an impedance measurement
///
/// Uses a single-frequency bioelectrical impedance estimate of fat-free
/// mass from height squared over resistance, total weight, and a sex
/// offset, then splits the lean mass into water, muscle, and bone
/// fractions. Results are clamped to physiological ranges. The five fields
/// are always produced together.
fn derive_composition(
    weight: f32,
    unit: WeightUnit,
    impedance_ohms: u16,
    biometrics: &UserBiometrics,
) -> BodyComposition {
    let weight_kg = match unit {
        WeightUnit::Kilograms => weight,
        WeightUnit::Pounds => weight / LB_PER_KG,
    };
    let height_cm = biometrics.height_cm;
    let height_m = height_cm / 100.0;
    let impedance = f32::from(impedance_ohms);

    let sex_offset = match biometrics.sex {
        Sex::Male => 4.229,
        Sex::Female => 0.0,
    };

    // Fat-free mass from height^2/R with weight, age, and sex terms.
    let fat_free_mass = (0.518 * (height_cm * height_cm) / impedance + 0.231 * weight_kg
        - 0.027 * f32::from(biometrics.age_years)
        + sex_offset
        - 4.104)
        .clamp(weight_kg * 0.25, weight_kg * 0.95);

    let body_fat_pct = ((1.0 - fat_free_mass / weight_kg) * 100.0).clamp(5.0, 75.0);

    // Lean tissue is roughly 73% water.
    let water_pct = ((100.0 - body_fat_pct) * 0.73).clamp(20.0, 85.0);

    let bone_mass_kg = (fat_free_mass * 0.052).clamp(0.5, 8.0);
    let muscle_mass_kg = (fat_free_mass - bone_mass_kg).max(0.0);

    let bmi = weight_kg / (height_m * height_m);

    BodyComposition {
        body_fat_pct,
        water_pct,
        muscle_mass_kg,
        bone_mass_kg,
        bmi,
    }
}

/// Select the decoding strategy for a device from its advertisement
/// signature
///
/// Impedance-capable scales advertise the body-composition service or the
/// impedance vendor's manufacturer id; weight-only scales advertise the
/// weight-scale service or the standard vendor id. Returns `None` when the
/// advertisement matches no known scale signature.
#[must_use]
pub fn detect_variant(
    services: &[Uuid],
    manufacturer_data: &HashMap<u16, Vec<u8>>,
) -> Option<ProtocolVariant> {
    let body_composition = Uuid::parse_str(crate::BODY_COMPOSITION_SERVICE_UUID).ok()?;
    let weight_scale = Uuid::parse_str(crate::WEIGHT_SCALE_SERVICE_UUID).ok()?;

    if services.contains(&body_composition)
        || manufacturer_data.contains_key(&IMPEDANCE_MANUFACTURER_ID)
    {
        return Some(ProtocolVariant::Impedance);
    }

    if services.contains(&weight_scale) || manufacturer_data.contains_key(&STANDARD_MANUFACTURER_ID)
    {
        return Some(ProtocolVariant::Standard);
    }

    None
}

/// Vendor display name for a known manufacturer id
#[must_use]
pub const fn vendor_name(manufacturer_id: u16) -> Option<&'static str> {
    match manufacturer_id {
        IMPEDANCE_MANUFACTURER_ID => Some("Huami"),
        STANDARD_MANUFACTURER_ID => Some("Chipsea"),
        _ => None,
    }
}

/// XOR of all bytes, the standard-frame checksum
fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Low byte of the additive checksum, used by impedance frames
fn sum_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Encode a weight-only frame
///
/// Used by the mock data source and tests; real scales produce these
/// frames themselves.
#[must_use]
pub fn encode_weight_frame(weight_tenths: u16, unit: WeightUnit, stabilized: bool) -> Vec<u8> {
    let mut flags = 0u8;
    if unit == WeightUnit::Pounds {
        flags |= FLAG_UNIT_POUNDS;
    }
    if stabilized {
        flags |= FLAG_STABILIZED;
    }

    let weight = weight_tenths.to_le_bytes();
    let mut frame = vec![flags, weight[0], weight[1], 0x00];
    frame.push(xor_checksum(&frame));
    frame
}

/// Encode an extended impedance frame
///
/// Setting `impedance_ohms` to a non-zero value together with `stabilized`
/// produces the post-stabilization broadcast from which extended fields
/// can be derived.
#[must_use]
pub fn encode_impedance_frame(
    weight_tenths: u16,
    unit: WeightUnit,
    stabilized: bool,
    impedance_ohms: u16,
) -> Vec<u8> {
    let mut flags = 0u8;
    if unit == WeightUnit::Pounds {
        flags |= FLAG_UNIT_POUNDS;
    }
    if stabilized {
        flags |= FLAG_STABILIZED;
    }
    if impedance_ohms > 0 {
        flags |= FLAG_IMPEDANCE;
    }

    let weight = weight_tenths.to_le_bytes();
    let impedance = impedance_ohms.to_le_bytes();
    let mut frame = vec![
        flags,
        weight[0],
        weight[1],
        impedance[0],
        impedance[1],
        0x00,
    ];
    frame.resize(IMPEDANCE_FRAME_LEN - 1, 0x00);
    frame.push(sum_checksum(&frame));
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn biometrics() -> UserBiometrics {
        UserBiometrics {
            sex: Sex::Male,
            height_cm: 175.0,
            age_years: 30,
        }
    }

    #[test]
    fn test_decode_weight_kilograms() {
        let frame = encode_weight_frame(700, WeightUnit::Kilograms, true);
        let data = decode(&frame, ProtocolVariant::Standard, None).unwrap();

        assert!((data.weight - 70.0).abs() < f32::EPSILON);
        assert_eq!(data.unit, WeightUnit::Kilograms);
        assert!(data.stabilized);
        assert!(data.composition.is_none());
    }

    #[test]
    fn test_decode_weight_pounds() {
        let frame = encode_weight_frame(1543, WeightUnit::Pounds, false);
        let data = decode(&frame, ProtocolVariant::Standard, None).unwrap();

        assert!((data.weight - 154.3).abs() < 0.001);
        assert_eq!(data.unit, WeightUnit::Pounds);
        assert!(!data.stabilized);
    }

    #[test]
    fn test_bad_checksum_rejected_whole() {
        let mut frame = encode_weight_frame(700, WeightUnit::Kilograms, true);
        *frame.last_mut().unwrap() ^= 0xFF;

        let err = decode(&frame, ProtocolVariant::Standard, None).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let err = decode(&[0x00, 0x01], ProtocolVariant::Standard, None).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));

        let frame = encode_weight_frame(700, WeightUnit::Kilograms, true);
        let err = decode(&frame, ProtocolVariant::Impedance, None).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_zero_weight_out_of_range() {
        let frame = encode_weight_frame(0, WeightUnit::Kilograms, true);
        let err = decode(&frame, ProtocolVariant::Standard, None).unwrap_err();
        assert!(matches!(err, ProtocolError::OutOfRange(_)));
    }

    #[test]
    fn test_impedance_frame_with_biometrics() {
        let frame = encode_impedance_frame(723, WeightUnit::Kilograms, true, 510);
        let data = decode(&frame, ProtocolVariant::Impedance, Some(&biometrics())).unwrap();

        assert!((data.weight - 72.3).abs() < 0.001);
        let composition = data.composition.expect("extended fields expected");
        assert!(composition.body_fat_pct > 5.0 && composition.body_fat_pct < 60.0);
        assert!(composition.water_pct > 20.0 && composition.water_pct < 85.0);
        assert!(composition.muscle_mass_kg > 0.0);
        assert!(composition.bone_mass_kg >= 0.5);
        assert!((composition.bmi - 23.6).abs() < 0.1);
    }

    #[test]
    fn test_no_biometrics_no_extended_fields() {
        let frame = encode_impedance_frame(723, WeightUnit::Kilograms, true, 510);
        let data = decode(&frame, ProtocolVariant::Impedance, None).unwrap();

        assert!((data.weight - 72.3).abs() < 0.001);
        assert!(data.composition.is_none());
    }

    #[test]
    fn test_implausible_biometrics_treated_as_absent() {
        let frame = encode_impedance_frame(723, WeightUnit::Kilograms, true, 510);
        let bad = UserBiometrics {
            height_cm: 10.0,
            ..biometrics()
        };
        let data = decode(&frame, ProtocolVariant::Impedance, Some(&bad)).unwrap();
        assert!(data.composition.is_none());
    }

    #[test]
    fn test_pre_stabilization_frame_weight_only() {
        // Impedance bit without the stabilized bit is a transient reading.
        let frame = encode_impedance_frame(723, WeightUnit::Kilograms, false, 510);

        let data = decode(&frame, ProtocolVariant::Impedance, Some(&biometrics())).unwrap();
        assert!(!data.stabilized);
        assert!(data.composition.is_none());
    }

    #[test]
    fn test_composition_from_pound_frames_matches_kg() {
        // 72.3 kg expressed in tenths of a pound.
        let kg_frame = encode_impedance_frame(723, WeightUnit::Kilograms, true, 510);
        let lb_frame = encode_impedance_frame(1594, WeightUnit::Pounds, true, 510);

        let kg = decode(&kg_frame, ProtocolVariant::Impedance, Some(&biometrics())).unwrap();
        let lb = decode(&lb_frame, ProtocolVariant::Impedance, Some(&biometrics())).unwrap();

        let kg_comp = kg.composition.unwrap();
        let lb_comp = lb.composition.unwrap();
        assert!((kg_comp.body_fat_pct - lb_comp.body_fat_pct).abs() < 0.2);
        assert!((kg_comp.bmi - lb_comp.bmi).abs() < 0.1);
    }

    #[test]
    fn test_variant_detection() {
        let body_composition =
            Uuid::parse_str(crate::BODY_COMPOSITION_SERVICE_UUID).unwrap();
        let weight_scale = Uuid::parse_str(crate::WEIGHT_SCALE_SERVICE_UUID).unwrap();

        assert_eq!(
            detect_variant(&[body_composition], &HashMap::new()),
            Some(ProtocolVariant::Impedance)
        );
        assert_eq!(
            detect_variant(&[weight_scale], &HashMap::new()),
            Some(ProtocolVariant::Standard)
        );

        let mut vendor = HashMap::new();
        vendor.insert(IMPEDANCE_MANUFACTURER_ID, vec![0x01]);
        assert_eq!(
            detect_variant(&[], &vendor),
            Some(ProtocolVariant::Impedance)
        );

        assert_eq!(detect_variant(&[], &HashMap::new()), None);
    }

    #[test]
    fn test_checksum_helpers() {
        assert_eq!(xor_checksum(&[0x12, 0x34]), 0x26);
        assert_eq!(sum_checksum(&[0xFF, 0x02]), 0x01);
    }
}
