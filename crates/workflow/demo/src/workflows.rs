//! Sample workflows exercised by the demo scenarios

use serde_json::{json, Value};
use workflow_engine::{predicate, Step, StepError, Workflow};
use workflow_types::WorkflowResult;

fn amount(value: &Value) -> f64 {
    value["amount"].as_f64().unwrap_or_default()
}

/// Order intake: validate, price in parallel, then route by total
pub fn order_intake() -> WorkflowResult<Workflow> {
    Workflow::builder("order-intake")
        .description("Validate an order, price it and route it for fulfilment")
        .then(Step::new("validate", |ctx| async move {
            let order = ctx.input_data().clone();
            if amount(&order) <= 0.0 {
                return Err(StepError::failed("order amount must be positive"));
            }
            Ok(order)
        }))
        .parallel(vec![
            Step::new("tax", |ctx| async move {
                Ok(json!({ "amount": amount(ctx.input_data()) * 0.2 }))
            }),
            Step::new("shipping", |ctx| async move {
                let fee = if amount(ctx.input_data()) > 100.0 { 0.0 } else { 9.5 };
                Ok(json!({ "amount": fee }))
            }),
        ])
        .then(Step::new("total", |ctx| async move {
            let base = ctx
                .get_step_result("validate")
                .map(|order| amount(&order))
                .unwrap_or_default();
            let input = ctx.input_data();
            let total = base + amount(&input["tax"]) + amount(&input["shipping"]);
            Ok(json!({ "total": total }))
        }))
        .branch(vec![
            (
                predicate(|ctx| async move { Ok(ctx.input_data()["total"].as_f64() > Some(500.0)) }),
                Step::new("manual-review", |ctx| async move {
                    Ok(json!({ "queue": "review", "total": ctx.input_data()["total"].clone() }))
                }),
            ),
            (
                predicate(|ctx| async move { Ok(ctx.input_data()["total"].as_f64() <= Some(500.0)) }),
                Step::new("auto-fulfil", |ctx| async move {
                    Ok(json!({ "queue": "warehouse", "total": ctx.input_data()["total"].clone() }))
                }),
            ),
        ])
        .commit()
}

/// Expense approval: suspends until a reviewer resumes the run
pub fn expense_approval() -> WorkflowResult<Workflow> {
    let review = Workflow::builder("expense-review")
        .then(Step::new("manager-approval", |ctx| async move {
            match ctx.resume_data() {
                Some(decision) => Ok(json!({
                    "approved": decision["approved"].as_bool().unwrap_or(false),
                    "reviewer": decision["reviewer"].clone(),
                })),
                None => ctx.suspend(json!({ "expense": ctx.input_data().clone() })),
            }
        }))
        .commit()?;

    Workflow::builder("expense-approval")
        .description("Route an expense through a suspended manager review")
        .then(Step::from_workflow(review))
        .then(Step::new("notify", |ctx| async move {
            let approved = ctx.input_data()["approved"].as_bool().unwrap_or(false);
            Ok(json!({ "status": if approved { "paid" } else { "rejected" } }))
        }))
        .commit()
}

/// Batch resize: foreach over images with a flaky uploader that retries
pub fn batch_resize() -> WorkflowResult<Workflow> {
    Workflow::builder("batch-resize")
        .description("Resize a batch of images and publish the results")
        .foreach(
            Step::new("resize", |ctx| async move {
                let name = ctx.input_data().as_str().unwrap_or("unnamed").to_string();
                ctx.emit("tool-call", json!({ "toolName": "resize", "args": { "image": name } }))
                    .await?;
                Ok(json!(format!("{}@2x", name)))
            }),
            2,
        )
        .sleep(25)
        .then(
            Step::new("publish", |ctx| async move {
                if ctx.run_count() == 0 {
                    return Err(StepError::failed("upload endpoint unavailable"));
                }
                Ok(json!({ "published": ctx.input_data().clone(), "attempts": ctx.run_count() + 1 }))
            })
            .with_retries(3),
        )
        .commit()
}
