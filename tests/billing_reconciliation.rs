use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use sqlx::PgPool;

use membership_backend::billing::fees;
use membership_backend::billing::{
    BillGenerator, BillType, CycleService, NewPayment, PaymentReconciler,
};
use membership_backend::error::AppError;
use membership_backend::membership::{MemberType, Membership, MembershipStatus, NewMembership};
use membership_backend::membership::MembershipService;
use membership_backend::notifications::{
    NotificationDispatcher, NotificationEvent, NotificationHandler,
};
use membership_backend::reference;
use membership_backend::BillingConfig;

async fn approved_membership(pool: &PgPool, email: &str) -> Membership {
    let contact_id: i32 = sqlx::query_scalar(
        "INSERT INTO contacts (first_name, last_name, email) VALUES ('Maija', 'Maksaja', $1) RETURNING id",
    )
    .bind(email)
    .fetch_one(pool)
    .await
    .unwrap();
    let service = MembershipService::new(pool.clone(), NotificationDispatcher::new());
    let membership = service
        .submit_application(&NewMembership {
            member_type: MemberType::Person,
            municipality: "Espoo".into(),
            nationality: "Finnish".into(),
            birth_year: Some(1979),
            organization_registration_number: None,
            extra_info: None,
            public_memberlist: false,
            person_id: Some(contact_id),
            organization_id: None,
            billing_contact_id: None,
            tech_contact_id: None,
        })
        .await
        .unwrap();
    service.preapprove(membership.id, "admin").await.unwrap();
    let membership = service.approve(membership.id, "admin").await.unwrap();
    assert_eq!(membership.status, MembershipStatus::Approved);
    membership
}

fn payment(reference: &str, amount_cents: i64, transaction_id: &str) -> NewPayment {
    NewPayment {
        reference_number: reference.to_string(),
        message: String::new(),
        transaction_id: transaction_id.to_string(),
        payment_day: Utc::now(),
        amount_cents,
        payment_type: "deposit".into(),
        payer_name: "Maija Maksaja".into(),
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn open_cycle_assigns_fee_and_valid_reference(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let membership = approved_membership(&pool, "fee@example.org").await;
    let cycles = CycleService::new(pool.clone());

    // No fee rows yet: cycle creation is blocked outright.
    let err = cycles.open_cycle(&membership, None).await.unwrap_err();
    assert!(matches!(err, AppError::NoFeeDefined { .. }));

    fees::insert_fee(
        &pool,
        MemberType::Person,
        Utc.with_ymd_and_hms(2010, 1, 1, 0, 0, 0).unwrap(),
        3500,
        24,
    )
    .await
    .unwrap();
    fees::insert_fee(
        &pool,
        MemberType::Person,
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        4000,
        24,
    )
    .await
    .unwrap();

    let cycle = cycles.open_cycle(&membership, None).await.unwrap();
    // Latest fee effective before the cycle start wins.
    assert_eq!(cycle.sum_cents, 4000);
    assert!(reference::validate(&cycle.reference_number).unwrap());
    assert!(!cycle.is_paid);

    let rf = reference::to_international(&cycle.reference_number).unwrap();
    assert!(rf.starts_with("RF"));
    assert!(rf.ends_with(&cycle.reference_number));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn partial_payments_accumulate_until_covered(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let membership = approved_membership(&pool, "partial@example.org").await;
    fees::insert_fee(&pool, MemberType::Person, Utc::now() - Duration::days(1), 10000, 0)
        .await
        .unwrap();
    let cycles = CycleService::new(pool.clone());
    let reconciler = PaymentReconciler::new(pool.clone(), NotificationDispatcher::new());
    let cycle = cycles.open_cycle(&membership, None).await.unwrap();

    let first = reconciler
        .record_payment(&payment(&cycle.reference_number, 6000, "TX-1"))
        .await
        .unwrap();
    reconciler.attach(first.id, cycle.id, "teller").await.unwrap();
    assert_eq!(cycles.amount_paid(cycle.id).await.unwrap(), 6000);
    let paid: bool = sqlx::query_scalar("SELECT is_paid FROM billing_cycles WHERE id = $1")
        .bind(cycle.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(!paid, "a partial payment must not mark the cycle paid");

    let second = reconciler
        .record_payment(&payment(&cycle.reference_number, 4000, "TX-2"))
        .await
        .unwrap();
    reconciler.attach(second.id, cycle.id, "teller").await.unwrap();
    let paid: bool = sqlx::query_scalar("SELECT is_paid FROM billing_cycles WHERE id = $1")
        .bind(cycle.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(paid);

    // Detaching drops the cycle back to unpaid.
    reconciler.detach(second.id, "teller").await.unwrap();
    let paid: bool = sqlx::query_scalar("SELECT is_paid FROM billing_cycles WHERE id = $1")
        .bind(cycle.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(!paid);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn attach_is_exclusive_and_detach_is_idempotent(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let membership = approved_membership(&pool, "exclusive@example.org").await;
    fees::insert_fee(&pool, MemberType::Person, Utc::now() - Duration::days(1), 4000, 0)
        .await
        .unwrap();
    let cycles = CycleService::new(pool.clone());
    let reconciler = PaymentReconciler::new(pool.clone(), NotificationDispatcher::new());
    let cycle = cycles.open_cycle(&membership, None).await.unwrap();

    let paid = reconciler
        .record_payment(&payment(&cycle.reference_number, 4000, "TX-10"))
        .await
        .unwrap();
    reconciler.attach(paid.id, cycle.id, "teller").await.unwrap();
    let err = reconciler
        .attach(paid.id, cycle.id, "teller")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PaymentAlreadyAttached { .. }));

    let loose = reconciler
        .record_payment(&payment("", 100, "TX-11"))
        .await
        .unwrap();
    // Detaching a payment that was never attached is a no-op.
    reconciler.detach(loose.id, "teller").await.unwrap();
    reconciler.detach(loose.id, "teller").await.unwrap();
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn ignored_payments_do_not_count(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let membership = approved_membership(&pool, "ignored@example.org").await;
    fees::insert_fee(&pool, MemberType::Person, Utc::now() - Duration::days(1), 4000, 0)
        .await
        .unwrap();
    let cycles = CycleService::new(pool.clone());
    let reconciler = PaymentReconciler::new(pool.clone(), NotificationDispatcher::new());
    let cycle = cycles.open_cycle(&membership, None).await.unwrap();

    let p = reconciler
        .record_payment(&payment(&cycle.reference_number, 4000, "TX-20"))
        .await
        .unwrap();
    reconciler.attach(p.id, cycle.id, "teller").await.unwrap();
    sqlx::query("UPDATE payments SET ignore = true WHERE id = $1")
        .bind(p.id)
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(cycles.amount_paid(cycle.id).await.unwrap(), 0);
    assert!(!cycles.recompute_paid(cycle.id, "teller").await.unwrap());
}

struct DuplicateCounter {
    notices: Arc<AtomicUsize>,
}

#[async_trait]
impl NotificationHandler for DuplicateCounter {
    async fn handle(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        if matches!(event, NotificationEvent::DuplicatePaymentNotice { .. }) {
            self.notices.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn matching_sweep_attaches_and_flags_duplicates(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let membership = approved_membership(&pool, "sweep@example.org").await;
    fees::insert_fee(&pool, MemberType::Person, Utc::now() - Duration::days(1), 4000, 0)
        .await
        .unwrap();
    let notices = Arc::new(AtomicUsize::new(0));
    let mut notifier = NotificationDispatcher::new();
    notifier.register(Arc::new(DuplicateCounter {
        notices: notices.clone(),
    }));
    let cycles = CycleService::new(pool.clone());
    let reconciler = PaymentReconciler::new(pool.clone(), notifier);
    let cycle = cycles.open_cycle(&membership, None).await.unwrap();

    // Whitespace in the free-text reference is tolerated.
    let spaced = format!(
        "{} {}",
        &cycle.reference_number[..2],
        &cycle.reference_number[2..]
    );
    reconciler
        .record_payment(&payment(&spaced, 4000, "TX-30"))
        .await
        .unwrap();
    reconciler
        .record_payment(&payment("not-a-reference", 100, "TX-31"))
        .await
        .unwrap();

    let report = reconciler.match_unattached_payments("import").await.unwrap();
    assert_eq!(report.attached, 1);
    assert_eq!(report.invalid_reference, 1);
    assert_eq!(notices.load(Ordering::SeqCst), 0);

    // A second payment against the now-paid cycle is a duplicate and
    // triggers exactly one notice.
    reconciler
        .record_payment(&payment(&cycle.reference_number, 4000, "TX-32"))
        .await
        .unwrap();
    let report = reconciler.match_unattached_payments("import").await.unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(notices.load(Ordering::SeqCst), 1);

    let duplicate: bool =
        sqlx::query_scalar("SELECT duplicate FROM payments WHERE transaction_id = 'TX-32'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(duplicate);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn renewal_continues_from_previous_cycle_end(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let membership = approved_membership(&pool, "renewal@example.org").await;
    fees::insert_fee(&pool, MemberType::Person, Utc::now() - Duration::days(1), 4000, 0)
        .await
        .unwrap();
    let cycles = CycleService::new(pool.clone());
    let generator = BillGenerator::new(
        pool.clone(),
        BillingConfig::default(),
        NotificationDispatcher::new(),
    );

    let first = cycles.open_cycle(&membership, None).await.unwrap();
    let (second, bill) = generator.renew_cycle(&membership).await.unwrap();
    assert_eq!(second.start, first.end);
    assert_eq!(bill.reminder_count, 0);
    assert_ne!(second.reference_number, first.reference_number);

    let latest = cycles.latest_cycle(membership.id).await.unwrap().unwrap();
    assert_eq!(latest.id, second.id);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn reminder_document_states_the_remaining_balance(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let membership = approved_membership(&pool, "document@example.org").await;
    fees::insert_fee(&pool, MemberType::Person, Utc::now() - Duration::days(1), 10000, 24)
        .await
        .unwrap();
    let cycles = CycleService::new(pool.clone());
    let reconciler = PaymentReconciler::new(pool.clone(), NotificationDispatcher::new());
    let config = BillingConfig {
        iban_account_number: "FI12 3456 7890 1234 56".into(),
        bic_code: "ABCDFIHH".into(),
        ..BillingConfig::default()
    };
    let generator = BillGenerator::new(pool.clone(), config.clone(), NotificationDispatcher::new());

    let cycle = cycles.open_cycle(&membership, None).await.unwrap();
    let original = generator
        .issue(&cycle, 0, BillType::Email)
        .await
        .unwrap()
        .unwrap();
    let fields =
        membership_backend::billing::bill_document_fields(&pool, &config, &membership, &cycle, &original)
            .await
            .unwrap();
    assert_eq!(fields.sum_cents, 10000);
    assert_eq!(fields.amount_paid_cents, 0);
    assert!(fields.due_date.is_some());
    assert!(fields.rf_reference.starts_with("RF"));
    assert_eq!(fields.iban_account_number, "FI12 3456 7890 1234 56");

    let p = reconciler
        .record_payment(&payment(&cycle.reference_number, 6000, "TX-40"))
        .await
        .unwrap();
    reconciler.attach(p.id, cycle.id, "teller").await.unwrap();
    let reminder = generator
        .issue(&cycle, 1, BillType::Email)
        .await
        .unwrap()
        .unwrap();
    let fields =
        membership_backend::billing::bill_document_fields(&pool, &config, &membership, &cycle, &reminder)
            .await
            .unwrap();
    assert_eq!(fields.original_sum_cents, 10000);
    assert_eq!(fields.amount_paid_cents, 6000);
    assert_eq!(fields.sum_cents, 4000);
    assert_eq!(fields.non_vat_cents + fields.vat_cents, 4000);
    assert!(fields.due_date.is_none(), "reminders carry no due date of their own");
    assert!(fields.latest_payment_day.is_some());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn original_bills_can_be_cancelled_but_reminders_not(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let membership = approved_membership(&pool, "cancel@example.org").await;
    fees::insert_fee(&pool, MemberType::Person, Utc::now() - Duration::days(1), 4000, 0)
        .await
        .unwrap();
    let cycles = CycleService::new(pool.clone());
    let generator = BillGenerator::new(
        pool.clone(),
        BillingConfig::default(),
        NotificationDispatcher::new(),
    );
    let cycle = cycles.open_cycle(&membership, None).await.unwrap();

    let original = generator
        .issue(&cycle, 0, BillType::Email)
        .await
        .unwrap()
        .unwrap();
    membership_backend::billing::bills::cancel_bill(&pool, &original, "admin")
        .await
        .unwrap();
    assert!(
        membership_backend::billing::bills::is_bill_cancelled(&pool, original.id)
            .await
            .unwrap()
    );

    let reminder = generator
        .issue(&cycle, 1, BillType::Email)
        .await
        .unwrap()
        .unwrap();
    let err = membership_backend::billing::bills::cancel_bill(&pool, &reminder, "admin")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

struct BillCounter {
    bills: Arc<AtomicUsize>,
}

#[async_trait]
impl NotificationHandler for BillCounter {
    async fn handle(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        if matches!(event, NotificationEvent::BillIssued { .. }) {
            self.bills.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn zero_sum_cycle_is_paid_without_a_notice(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let membership = approved_membership(&pool, "waived@example.org").await;
    fees::insert_fee(&pool, MemberType::Person, Utc::now() - Duration::days(1), 0, 0)
        .await
        .unwrap();
    let bills = Arc::new(AtomicUsize::new(0));
    let mut notifier = NotificationDispatcher::new();
    notifier.register(Arc::new(BillCounter {
        bills: bills.clone(),
    }));
    let cycles = CycleService::new(pool.clone());
    let generator = BillGenerator::new(pool.clone(), BillingConfig::default(), notifier);
    let cycle = cycles.open_cycle(&membership, None).await.unwrap();

    generator.issue_and_send(&cycle, BillType::Email).await.unwrap();
    assert_eq!(bills.load(Ordering::SeqCst), 0, "fee-waived bills are not sent");
    let paid: bool = sqlx::query_scalar("SELECT is_paid FROM billing_cycles WHERE id = $1")
        .bind(cycle.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(paid);

    // The flip is audited like any other paid-status change.
    let history =
        membership_backend::audit::entity_history(&pool, "billing_cycle", &cycle.id.to_string(), 10)
            .await
            .unwrap();
    assert!(history.iter().any(|row| row.message == "marked as paid"));
}
