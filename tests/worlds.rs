// World codes: opening, re-opening, visiting, closing and code exhaustion.

mod common;

use axum::http::StatusCode;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;

use common::setup;
use tamagotchi_backend::pet::world::{generate_world_code, open_world};
use tamagotchi_backend::pet::PetError;

fn is_code(value: &serde_json::Value) -> bool {
    let Some(code) = value.as_str() else {
        return false;
    };
    code.len() == 7 && code.as_bytes()[4] == b'-'
}

#[tokio::test]
async fn test_open_and_visit_world() {
    let t = setup().await;
    let (_, token, pet_id) = t.owner_with_pet("alice").await;

    let (status, pet) = t
        .request("POST", &format!("/api/pet/{pet_id}/world"), Some(&token), Some(json!({ "open": true })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pet["world_open"], true);
    assert!(is_code(&pet["world_code"]));
    let code = pet["world_code"].as_str().unwrap().to_string();

    // Visiting needs no auth and accepts sloppy input
    let (status, view) = t
        .request("GET", &format!("/api/world/{code}"), None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["name"], "Tama");
    assert_eq!(view["visits"], 1);
    assert_eq!(view["stats"]["hunger"], 80);

    let sloppy = code.replace('-', "").to_ascii_lowercase();
    let (status, view) = t
        .request("GET", &format!("/api/world/{sloppy}"), None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["visits"], 2);

    let (status, worlds) = t.request("GET", "/api/worlds", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(worlds.as_array().unwrap().len(), 1);
    assert_eq!(worlds[0]["world_code"], code.as_str());
}

#[tokio::test]
async fn test_reopen_issues_new_code() {
    let t = setup().await;
    let (_, token, pet_id) = t.owner_with_pet("alice").await;

    let (_, first) = t
        .request("POST", &format!("/api/pet/{pet_id}/world"), Some(&token), Some(json!({ "open": true })))
        .await;
    let (status, second) = t
        .request("POST", &format!("/api/pet/{pet_id}/world"), Some(&token), Some(json!({ "open": true })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(first["world_code"], second["world_code"]);

    let old = first["world_code"].as_str().unwrap();
    let (status, body) = t.request("GET", &format!("/api/world/{old}"), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let new = second["world_code"].as_str().unwrap();
    let (status, _) = t.request("GET", &format!("/api/world/{new}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_close_world() {
    let t = setup().await;
    let (_, token, pet_id) = t.owner_with_pet("alice").await;

    let (_, opened) = t
        .request("POST", &format!("/api/pet/{pet_id}/world"), Some(&token), Some(json!({ "open": true })))
        .await;
    let code = opened["world_code"].as_str().unwrap().to_string();

    for _ in 0..2 {
        let (status, closed) = t
            .request("POST", &format!("/api/pet/{pet_id}/world"), Some(&token), Some(json!({ "open": false })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(closed["world_open"], false);
        assert!(closed["world_code"].is_null());
    }

    let (status, _) = t.request("GET", &format!("/api/world/{code}"), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, worlds) = t.request("GET", "/api/worlds", None, None).await;
    assert!(worlds.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_visit_unknown_or_malformed_code() {
    let t = setup().await;
    for code in ["ABCD-EF", "nope", "0000-00"] {
        let (status, _) = t.request("GET", &format!("/api/world/{code}"), None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "code {code}");
    }
}

#[tokio::test]
async fn test_generation_exhausted_when_every_candidate_is_taken() {
    let t = setup().await;
    let (_, _, pet_id) = t.owner_with_pet("alice").await;

    // The first three candidates a seeded generator produces are already in use.
    let mut seeded = StdRng::seed_from_u64(42);
    let taken: Vec<String> = (0..3).map(|_| generate_world_code(&mut seeded)).collect();
    for (i, code) in taken.iter().enumerate() {
        let (_, _, other) = t.owner_with_pet(&format!("neighbour{i}")).await;
        t.db.set_world_code(other, code).await.unwrap().unwrap();
    }

    let mut rng = StdRng::seed_from_u64(42);
    let err = open_world(&t.db, pet_id, &mut rng, 3).await.unwrap_err();
    assert!(matches!(err, PetError::GenerationExhausted { attempts: 3 }));
    let pet = t.db.get_pet(pet_id).await.unwrap().unwrap();
    assert!(!pet.world_open);

    // One more attempt gets past the collisions.
    let mut rng = StdRng::seed_from_u64(42);
    let pet = open_world(&t.db, pet_id, &mut rng, 4).await.unwrap();
    let code = pet.world_code.unwrap();
    assert!(!taken.contains(&code));
}

#[tokio::test]
async fn test_world_requires_owner() {
    let t = setup().await;
    let (_, _, pet_id) = t.owner_with_pet("alice").await;
    let (_, stranger) = t.user("mallory").await;

    let (status, _) = t
        .request("POST", &format!("/api/pet/{pet_id}/world"), None, Some(json!({ "open": true })))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = t
        .request("POST", &format!("/api/pet/{pet_id}/world"), Some(&stranger), Some(json!({ "open": true })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
