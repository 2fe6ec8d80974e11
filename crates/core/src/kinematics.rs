//! Compton kinematics helpers.
//!
//! All energies in keV, angles in radians. The scattered-photon energy
//! `eg` and recoil-electron energy `ee` fully determine the scatter
//! angle; the helpers here convert between the two views and weight
//! angles by the Klein-Nishina differential cross section.

/// Electron rest mass in keV.
pub const ELECTRON_MASS_KEV: f64 = 511.044;

/// Speed of light in cm/s, for time-of-flight checks.
pub const SPEED_OF_LIGHT_CM_S: f64 = 2.99792458e10;

/// `cos(phi)` of the Compton scatter angle from the energy split.
pub fn cos_phi_from_energies(ee: f64, eg: f64) -> f64 {
    1.0 - ELECTRON_MASS_KEV / eg + ELECTRON_MASS_KEV / (ee + eg)
}

/// Compton scatter angle from the energy split, clamped to [0, pi].
pub fn phi_from_energies(ee: f64, eg: f64) -> f64 {
    cos_phi_from_energies(ee, eg).clamp(-1.0, 1.0).acos()
}

/// Check whether an (electron, scattered-photon) energy pair is
/// compatible with Compton kinematics: the photon scatter angle, the
/// electron scatter angle, and the total scatter angle must all be
/// computable.
pub fn kinematics_ok(ee: f64, eg: f64) -> bool {
    if ee <= 0.0 || eg <= 0.0 {
        return false;
    }
    let e0 = ELECTRON_MASS_KEV;

    let cos_phi = 1.0 - e0 * (1.0 / eg - 1.0 / (ee + eg));
    if cos_phi <= -1.0 || cos_phi >= 1.0 {
        return false;
    }

    let cos_epsilon = ee * (ee + eg + e0) / ((ee + eg) * (ee * (ee + 2.0 * e0)).sqrt());
    if cos_epsilon <= -1.0 || cos_epsilon >= 1.0 {
        return false;
    }

    let cos_alpha = (ee * (eg - e0)) / (eg * (ee * (ee + 2.0 * e0)).sqrt());
    if cos_alpha <= -1.0 || cos_alpha >= 1.0 {
        return false;
    }

    true
}

/// Unnormalized Klein-Nishina differential cross section at incident
/// energy `ei` and scatter angle `phi`.
pub fn klein_nishina(ei: f64, phi: f64) -> f64 {
    if ei <= 0.0 || !(0.0..=std::f64::consts::PI).contains(&phi) {
        return 0.0;
    }
    const RADIUS: f64 = 2.8e-15; // classical electron radius, m

    let sin_phi = phi.sin();
    let eg = -ELECTRON_MASS_KEV * ei / (phi.cos() * ei - ei - ELECTRON_MASS_KEV);

    0.5 * RADIUS * RADIUS * eg * eg / (ei * ei) * (eg / ei + ei / eg - sin_phi * sin_phi) * sin_phi
}

/// Klein-Nishina value normalized to its maximum over `phi` at the
/// given incident energy, so the result lies in [0, 1].
pub fn klein_nishina_normalized(ei: f64, phi: f64) -> f64 {
    if ei <= 0.0 || !(0.0..=std::f64::consts::PI).contains(&phi) {
        return 0.0;
    }

    let mut max = 0.0_f64;
    let mut p = 0.0;
    while p < std::f64::consts::PI {
        let v = klein_nishina(ei, p);
        if v > max {
            max = v;
        }
        p += 0.01;
    }

    if max > 0.0 {
        (klein_nishina(ei, phi) / max).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Klein-Nishina value normalized so the distribution over `phi`
/// integrates to one at the given incident energy.
pub fn klein_nishina_normalized_by_area(ei: f64, phi: f64) -> f64 {
    if ei <= 0.0 || !(0.0..=std::f64::consts::PI).contains(&phi) {
        return 0.0;
    }
    const RADIUS: f64 = 2.8e-15;
    let e0 = ELECTRON_MASS_KEV;

    let normalization = 0.5 * e0 * e0 * RADIUS * RADIUS
        * (2.0 * ei * (ei * ei * ei + 9.0 * ei * ei * e0 + 8.0 * ei * e0 * e0 + 2.0 * e0 * e0 * e0)
            - (2.0 * ei + e0).powi(2)
                * (ei * ei - 2.0 * ei * e0 - 2.0 * e0 * e0)
                * ((e0 / (ei + e0)).ln() - ((2.0 * ei + e0) / (ei + e0)).ln()))
        / (ei * ei * ei * e0 * (2.0 * ei + e0) * (2.0 * ei + e0));

    if normalization > 0.0 {
        klein_nishina(ei, phi) / normalization
    } else {
        0.0
    }
}
