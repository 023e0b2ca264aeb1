//! Injection payload rendering.
//!
//! Renders a profile into the JavaScript blob installed into every new
//! document before page scripts run. Rendering is pure: all noise is derived
//! from the profile's seed, so the same profile always yields the same bytes.

use std::fmt::Write;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::FingerprintProfile;

/// WebGL vendor/renderer pairs seen on real desktop hardware.
const WEBGL_CONFIGS: [(&str, &str); 4] = [
    ("Intel Inc.", "Intel Iris OpenGL Engine"),
    ("Google Inc. (NVIDIA)", "ANGLE (NVIDIA GeForce GTX 1060)"),
    ("Google Inc. (AMD)", "ANGLE (AMD Radeon RX 580)"),
    ("Google Inc. (Intel)", "ANGLE (Intel HD Graphics 630)"),
];

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

/// Render the anti-detection script for a profile.
///
/// Covers the classic automation tells: `navigator.webdriver`, empty plugin
/// list, missing `window.chrome`, the notification-permission probe, screen
/// dimensions, plus seeded WebGL vendor/renderer spoofing and canvas noise.
/// Per-profile navigator overrides are emitted in catalog order.
pub fn render_injection_payload(profile: &FingerprintProfile) -> String {
    let mut rng = StdRng::seed_from_u64(profile.webgl_noise_seed);
    let (vendor, renderer) = WEBGL_CONFIGS[rng.gen_range(0..WEBGL_CONFIGS.len())];
    let shift_r: i32 = rng.gen_range(-5..5);
    let shift_g: i32 = rng.gen_range(-5..5);
    let shift_b: i32 = rng.gen_range(-5..5);

    let primary_lang = profile.locale.split('-').next().unwrap_or("en");

    let mut script = String::with_capacity(4096);
    script.push_str("(() => {\n");

    script.push_str(
        "Object.defineProperty(navigator, 'webdriver', { get: () => undefined });\n",
    );

    let _ = writeln!(
        script,
        "Object.defineProperty(navigator, 'languages', {{ get: () => [{}, {}] }});",
        js_string(&profile.locale),
        js_string(primary_lang),
    );

    script.push_str(
        "Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });\n",
    );

    script.push_str(
        "window.chrome = { runtime: {}, loadTimes: function() {}, csi: function() {}, app: {} };\n",
    );

    script.push_str(
        "const originalQuery = window.navigator.permissions.query;\n\
         window.navigator.permissions.query = (parameters) =>\n\
             parameters.name === 'notifications'\n\
                 ? Promise.resolve({ state: Notification.permission })\n\
                 : originalQuery(parameters);\n",
    );

    for (name, value) in &profile.navigator_overrides {
        let rendered = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
        let _ = writeln!(
            script,
            "Object.defineProperty(navigator, {}, {{ get: () => {} }});",
            js_string(name),
            rendered,
        );
    }

    let _ = writeln!(
        script,
        "Object.defineProperty(screen, 'width', {{ get: () => {} }});\n\
         Object.defineProperty(screen, 'height', {{ get: () => {} }});\n\
         Object.defineProperty(screen, 'availWidth', {{ get: () => {} }});\n\
         Object.defineProperty(screen, 'availHeight', {{ get: () => {} }});",
        profile.viewport.width,
        profile.viewport.height,
        profile.viewport.width,
        profile.viewport.height,
    );

    // UNMASKED_VENDOR_WEBGL = 37445, UNMASKED_RENDERER_WEBGL = 37446
    let _ = writeln!(
        script,
        "const getParameter = WebGLRenderingContext.prototype.getParameter;\n\
         WebGLRenderingContext.prototype.getParameter = function(parameter) {{\n\
             if (parameter === 37445) return {};\n\
             if (parameter === 37446) return {};\n\
             return getParameter.call(this, parameter);\n\
         }};",
        js_string(vendor),
        js_string(renderer),
    );

    let _ = writeln!(
        script,
        "const shift = {{ r: {shift_r}, g: {shift_g}, b: {shift_b} }};\n\
         const toDataURL = HTMLCanvasElement.prototype.toDataURL;\n\
         HTMLCanvasElement.prototype.toDataURL = function() {{\n\
             const context = this.getContext('2d');\n\
             if (context && this.width && this.height) {{\n\
                 const imageData = context.getImageData(0, 0, Math.min(this.width, 10), 1);\n\
                 for (let i = 0; i < imageData.data.length; i += 4) {{\n\
                     imageData.data[i] = imageData.data[i] + shift.r;\n\
                     imageData.data[i + 1] = imageData.data[i + 1] + shift.g;\n\
                     imageData.data[i + 2] = imageData.data[i + 2] + shift.b;\n\
                 }}\n\
                 context.putImageData(imageData, 0, 0);\n\
             }}\n\
             return toDataURL.apply(this, arguments);\n\
         }};",
    );

    script.push_str("})();\n");
    script
}

/// Realistic request headers matching the profile's locale.
///
/// Passed to the driver at context launch so the HTTP layer agrees with what
/// the injected script claims.
pub fn extra_headers(profile: &FingerprintProfile) -> Vec<(String, String)> {
    let primary_lang = profile.locale.split('-').next().unwrap_or("en");
    vec![
        (
            "Accept-Language".to_string(),
            format!("{},{};q=0.9", profile.locale, primary_lang),
        ),
        (
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
        ),
        ("Accept-Encoding".to_string(), "gzip, deflate, br".to_string()),
        ("Sec-Fetch-Dest".to_string(), "document".to_string()),
        ("Sec-Fetch-Mode".to_string(), "navigate".to_string()),
        ("Sec-Fetch-Site".to_string(), "none".to_string()),
        ("Sec-Fetch-User".to_string(), "?1".to_string()),
        ("Upgrade-Insecure-Requests".to_string(), "1".to_string()),
    ]
}
