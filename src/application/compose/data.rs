//! Build a [`Mapping`] from an arbitrary JSON record.
//!
//! A mapping spec names, for each placeholder token, a dot path into the
//! record (`stats.pace`, `photos.0`). Values are stringified. Remote images
//! are never fetched: an `IMG*` token whose value is an http(s) URL stays
//! unmapped, so the layer falls back to its own image or renders empty.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::domain::template::Mapping;

/// Token -> dot path into the data record.
pub type MappingSpec = BTreeMap<String, String>;

/// Spec used when a request brings data but no spec: the player-card tokens.
pub fn player_card_spec() -> MappingSpec {
    [
        ("PLAYER_NAME", "name"),
        ("POSITION", "position"),
        ("OVERALL", "overall"),
        ("PACE", "pace"),
        ("DRIBBLING", "dribbling"),
        ("SHOOTING", "shooting"),
        ("DEFENCE", "defence"),
        ("PASSING", "passing"),
        ("PHYSICAL", "physical"),
        ("IMG_AVATAR", "avatar_url"),
    ]
    .into_iter()
    .map(|(token, path)| (token.to_string(), path.to_string()))
    .collect()
}

/// Walk `path` through objects by key and arrays by index.
pub fn value_at_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(data, |current, part| match current {
        Value::Object(fields) => fields.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|index| items.get(index)),
        _ => None,
    })
}

/// Resolve every token of `spec` against `data`. Missing and `null` values
/// leave the token unmapped.
pub fn mapping_from_data(data: &Value, spec: &MappingSpec) -> Mapping {
    spec.iter()
        .filter_map(|(token, path)| {
            let text = match value_at_path(data, path)? {
                Value::Null => return None,
                Value::String(url) if is_image_token(token) && is_remote_url(url) => {
                    debug!(
                        target = "cardsmith::compose::data",
                        token = %token,
                        "Leaving remote image unmapped"
                    );
                    return None;
                }
                Value::String(text) => text.clone(),
                Value::Bool(flag) => flag.to_string(),
                Value::Number(number) => number.to_string(),
                nested => nested.to_string(),
            };
            Some((token.clone(), text))
        })
        .collect()
}

fn is_image_token(token: &str) -> bool {
    token
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("img"))
}

fn is_remote_url(value: &str) -> bool {
    let lower = value.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn default_spec_maps_player_fields() {
        let data = json!({
            "name": "Ada",
            "position": "ST",
            "overall": 91,
            "pace": 88,
            "avatar_url": "https://example.test/ada.png",
            "defence": null
        });

        let mapping = mapping_from_data(&data, &player_card_spec());
        assert_eq!(mapping.get("PLAYER_NAME").map(String::as_str), Some("Ada"));
        assert_eq!(mapping.get("OVERALL").map(String::as_str), Some("91"));
        assert!(!mapping.contains_key("IMG_AVATAR"));
        assert!(!mapping.contains_key("DEFENCE"));
        assert!(!mapping.contains_key("SHOOTING"));
    }

    #[test]
    fn inline_images_map_and_urls_only_skip_image_tokens() {
        let data = json!({
            "photo": "data:image/png;base64,AAAA",
            "site": "https://example.test/ada"
        });
        let spec: MappingSpec = [("img_photo", "photo"), ("WEBSITE", "site"), ("IMG_SITE", "site")]
            .into_iter()
            .map(|(token, path)| (token.to_string(), path.to_string()))
            .collect();

        let mapping = mapping_from_data(&data, &spec);
        assert_eq!(
            mapping.get("img_photo").map(String::as_str),
            Some("data:image/png;base64,AAAA")
        );
        assert_eq!(
            mapping.get("WEBSITE").map(String::as_str),
            Some("https://example.test/ada")
        );
        assert!(!mapping.contains_key("IMG_SITE"));
    }

    #[test]
    fn dot_paths_reach_nested_objects_and_arrays() {
        let data = json!({
            "player": { "stats": { "pace": 77, "fit": true } },
            "photos": ["first.png", "second.png"],
            "tags": ["a", "b"]
        });
        let spec: MappingSpec = [
            ("PACE", "player.stats.pace"),
            ("FIT", "player.stats.fit"),
            ("IMG_PHOTO", "photos.1"),
            ("TAGS", "tags"),
            ("MISSING", "player.stats.pace.deeper"),
            ("EMPTY", ""),
        ]
        .into_iter()
        .map(|(token, path)| (token.to_string(), path.to_string()))
        .collect();

        let mapping = mapping_from_data(&data, &spec);
        assert_eq!(mapping.get("PACE").map(String::as_str), Some("77"));
        assert_eq!(mapping.get("FIT").map(String::as_str), Some("true"));
        assert_eq!(mapping.get("IMG_PHOTO").map(String::as_str), Some("second.png"));
        assert_eq!(mapping.get("TAGS").map(String::as_str), Some(r#"["a","b"]"#));
        assert_eq!(mapping.len(), 4);
    }
}
