//! Settlement integration tests: recording, rejecting, amending, and
//! deleting payments against invoices.

mod common;

use common::{money, TestApp};
use rust_decimal::Decimal;

#[tokio::test]
async fn partial_payment_updates_balance_and_status() {
    let app = TestApp::spawn().await;
    let user = app.create_user("partial-payment").await;
    let customer = app.create_customer(user, "Acme Corp").await;
    let invoice = app.create_invoice(user, customer, "INV-001", "1000.00").await;

    let response = app.record_payment(user, invoice, "400.00", "2026-01-20").await;
    assert_eq!(response.status(), 201);

    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(money(&body["payment"]["amount_paid"]), "400.00".parse::<Decimal>().unwrap());
    assert_eq!(body["invoice"]["status"], "partially_paid");
    assert_eq!(money(&body["invoice"]["amount_due"]), "600.00".parse::<Decimal>().unwrap());
    assert_eq!(money(&body["invoice"]["paid"]), "400.00".parse::<Decimal>().unwrap());
}

#[tokio::test]
async fn final_payment_marks_invoice_paid() {
    let app = TestApp::spawn().await;
    let user = app.create_user("final-payment").await;
    let customer = app.create_customer(user, "Acme Corp").await;
    let invoice = app.create_invoice(user, customer, "INV-001", "1000.00").await;

    let first = app.record_payment(user, invoice, "400.00", "2026-01-20").await;
    assert_eq!(first.status(), 201);

    let second = app.record_payment(user, invoice, "600.00", "2026-01-25").await;
    assert_eq!(second.status(), 201);

    let body: serde_json::Value = second.json().await.expect("Failed to parse JSON");
    assert_eq!(body["invoice"]["status"], "paid");
    assert_eq!(money(&body["invoice"]["amount_due"]), Decimal::ZERO);
    assert_eq!(money(&body["invoice"]["paid"]), "1000.00".parse::<Decimal>().unwrap());
}

#[tokio::test]
async fn overpayment_is_rejected_without_changing_state() {
    let app = TestApp::spawn().await;
    let user = app.create_user("overpayment").await;
    let customer = app.create_customer(user, "Acme Corp").await;
    let invoice = app.create_invoice(user, customer, "INV-001", "1000.00").await;

    let first = app.record_payment(user, invoice, "1000.00", "2026-01-20").await;
    assert_eq!(first.status(), 201);

    let before = app.get_invoice(user, invoice).await;

    // Even a cent beyond the remaining amount due must be rejected.
    let response = app.record_payment(user, invoice, "0.01", "2026-01-21").await;
    assert_eq!(response.status(), 422);

    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    let messages = body["messages"].as_array().expect("Missing messages list");
    assert!(
        messages
            .iter()
            .any(|m| m.as_str().unwrap().contains("exceeds the remaining amount due")),
        "unexpected messages: {:?}",
        messages
    );

    // Rejection is idempotent: invoice and ledger are untouched.
    let after = app.get_invoice(user, invoice).await;
    assert_eq!(before, after);
}

#[tokio::test]
async fn non_positive_payment_amounts_are_rejected() {
    let app = TestApp::spawn().await;
    let user = app.create_user("non-positive").await;
    let customer = app.create_customer(user, "Acme Corp").await;
    let invoice = app.create_invoice(user, customer, "INV-001", "500.00").await;

    let zero = app.record_payment(user, invoice, "0.00", "2026-01-20").await;
    assert_eq!(zero.status(), 422);

    let negative = app.record_payment(user, invoice, "-10.00", "2026-01-20").await;
    assert_eq!(negative.status(), 422);

    let detail = app.get_invoice(user, invoice).await;
    assert_eq!(detail["payments"].as_array().unwrap().len(), 0);
    assert_eq!(detail["invoice"]["status"], "draft");
}

#[tokio::test]
async fn payment_by_non_owner_is_forbidden() {
    let app = TestApp::spawn().await;
    let owner = app.create_user("owner").await;
    let intruder = app.create_user("intruder").await;
    let customer = app.create_customer(owner, "Acme Corp").await;
    let invoice = app.create_invoice(owner, customer, "INV-001", "500.00").await;

    let response = app.record_payment(intruder, invoice, "100.00", "2026-01-20").await;
    assert_eq!(response.status(), 403);

    // No payment row was created.
    let detail = app.get_invoice(owner, invoice).await;
    assert_eq!(detail["payments"].as_array().unwrap().len(), 0);
    assert_eq!(money(&detail["invoice"]["amount_due"]), "500.00".parse::<Decimal>().unwrap());
}

#[tokio::test]
async fn payment_on_missing_invoice_is_not_found() {
    let app = TestApp::spawn().await;
    let user = app.create_user("missing-invoice").await;

    let response = app.record_payment(user, 99999999, "100.00", "2026-01-20").await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn missing_user_header_is_unauthorized() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/invoices/1/payments", app.address))
        .json(&serde_json::json!({ "amount_paid": "10.00", "payment_date": "2026-01-20" }))
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn multiple_partial_payments_accumulate() {
    let app = TestApp::spawn().await;
    let user = app.create_user("installments").await;
    let customer = app.create_customer(user, "Acme Corp").await;
    let invoice = app.create_invoice(user, customer, "INV-001", "300.00").await;

    for (amount, expected_due) in [("100.00", "200.00"), ("100.00", "100.00"), ("100.00", "0.00")] {
        let response = app.record_payment(user, invoice, amount, "2026-01-20").await;
        assert_eq!(response.status(), 201);
        let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(
            money(&body["invoice"]["amount_due"]),
            expected_due.parse::<Decimal>().unwrap()
        );
    }

    let detail = app.get_invoice(user, invoice).await;
    assert_eq!(detail["invoice"]["status"], "paid");
    assert_eq!(detail["payments"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn deleting_a_payment_recomputes_the_invoice() {
    let app = TestApp::spawn().await;
    let user = app.create_user("delete-payment").await;
    let customer = app.create_customer(user, "Acme Corp").await;
    let invoice = app.create_invoice(user, customer, "INV-001", "1000.00").await;

    let response = app.record_payment(user, invoice, "400.00", "2026-01-20").await;
    assert_eq!(response.status(), 201);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    let payment_id = body["payment"]["id"].as_i64().unwrap();

    let delete = app
        .client
        .delete(format!("{}/payments/{}", app.address, payment_id))
        .header("X-User-Id", user)
        .send()
        .await
        .expect("Failed to delete payment");
    assert_eq!(delete.status(), 200);

    let updated: serde_json::Value = delete.json().await.expect("Failed to parse JSON");
    assert_eq!(updated["status"], "unpaid");
    assert_eq!(money(&updated["amount_due"]), "1000.00".parse::<Decimal>().unwrap());
    assert_eq!(money(&updated["paid"]), Decimal::ZERO);

    let detail = app.get_invoice(user, invoice).await;
    assert_eq!(detail["payments"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn updating_a_payment_recomputes_the_invoice() {
    let app = TestApp::spawn().await;
    let user = app.create_user("update-payment").await;
    let customer = app.create_customer(user, "Acme Corp").await;
    let invoice = app.create_invoice(user, customer, "INV-001", "1000.00").await;

    let response = app.record_payment(user, invoice, "400.00", "2026-01-20").await;
    assert_eq!(response.status(), 201);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    let payment_id = body["payment"]["id"].as_i64().unwrap();

    let update = app
        .client
        .put(format!("{}/payments/{}", app.address, payment_id))
        .header("X-User-Id", user)
        .json(&serde_json::json!({ "amount_paid": "250.00" }))
        .send()
        .await
        .expect("Failed to update payment");
    assert_eq!(update.status(), 200);

    let outcome: serde_json::Value = update.json().await.expect("Failed to parse JSON");
    assert_eq!(money(&outcome["payment"]["amount_paid"]), "250.00".parse::<Decimal>().unwrap());
    assert_eq!(outcome["invoice"]["status"], "partially_paid");
    assert_eq!(money(&outcome["invoice"]["amount_due"]), "750.00".parse::<Decimal>().unwrap());

    // An amendment beyond the invoice total is rejected like any overpayment.
    let too_big = app
        .client
        .put(format!("{}/payments/{}", app.address, payment_id))
        .header("X-User-Id", user)
        .json(&serde_json::json!({ "amount_paid": "1200.00" }))
        .send()
        .await
        .expect("Failed to send update");
    assert_eq!(too_big.status(), 422);
}

#[tokio::test]
async fn concurrent_settlements_cannot_jointly_overpay() {
    let app = TestApp::spawn().await;
    let user = app.create_user("concurrent").await;
    let customer = app.create_customer(user, "Acme Corp").await;
    let invoice = app.create_invoice(user, customer, "INV-001", "1000.00").await;

    // Each individually valid, jointly 200.00 over the total.
    let (a, b) = tokio::join!(
        app.record_payment(user, invoice, "600.00", "2026-01-20"),
        app.record_payment(user, invoice, "600.00", "2026-01-20"),
    );

    let statuses = [a.status().as_u16(), b.status().as_u16()];
    let successes = statuses.iter().filter(|s| **s == 201).count();
    let rejections = statuses
        .iter()
        .filter(|s| **s == 422 || **s == 409)
        .count();
    assert_eq!(successes, 1, "exactly one settlement must win: {:?}", statuses);
    assert_eq!(rejections, 1, "the loser must be rejected: {:?}", statuses);

    let detail = app.get_invoice(user, invoice).await;
    assert_eq!(detail["payments"].as_array().unwrap().len(), 1);
    assert_eq!(money(&detail["invoice"]["amount_due"]), "400.00".parse::<Decimal>().unwrap());
    assert_eq!(money(&detail["invoice"]["paid"]), "600.00".parse::<Decimal>().unwrap());
}

#[tokio::test]
async fn settlement_invariant_holds_across_mixed_operations() {
    let app = TestApp::spawn().await;
    let user = app.create_user("invariant").await;
    let customer = app.create_customer(user, "Acme Corp").await;
    let invoice = app.create_invoice(user, customer, "INV-001", "750.50").await;

    let first = app.record_payment(user, invoice, "200.25", "2026-01-20").await;
    assert_eq!(first.status(), 201);
    let second = app.record_payment(user, invoice, "100.10", "2026-01-21").await;
    assert_eq!(second.status(), 201);

    let detail = app.get_invoice(user, invoice).await;
    let total = money(&detail["invoice"]["total_amount"]);
    let due = money(&detail["invoice"]["amount_due"]);
    let ledger_sum: Decimal = detail["payments"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| money(&p["amount_paid"]))
        .sum();

    // amount_due == total_amount - sum(payments), and never negative.
    assert_eq!(due, total - ledger_sum);
    assert!(due >= Decimal::ZERO);
    assert_eq!(detail["invoice"]["status"], "partially_paid");
}

#[tokio::test]
async fn settlement_emits_history_entries() {
    let app = TestApp::spawn().await;
    let user = app.create_user("history").await;
    let customer = app.create_customer(user, "Acme Corp").await;
    let invoice = app.create_invoice(user, customer, "INV-001", "500.00").await;

    let response = app.record_payment(user, invoice, "500.00", "2026-01-20").await;
    assert_eq!(response.status(), 201);
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    let payment_id = body["payment"]["id"].as_i64().unwrap();

    let history = app
        .client
        .get(format!("{}/invoices/{}/history", app.address, invoice))
        .header("X-User-Id", user)
        .send()
        .await
        .expect("Failed to fetch history");
    assert_eq!(history.status(), 200);

    let entries: serde_json::Value = history.json().await.expect("Failed to parse JSON");
    let entries = entries.as_array().unwrap();
    assert!(entries
        .iter()
        .any(|e| e["action"] == "invoice_created" && e["payment_id"].is_null()));
    assert!(entries
        .iter()
        .any(|e| e["action"] == "payment_recorded" && e["payment_id"] == payment_id));
}
