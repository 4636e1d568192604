use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use message_bus::{
    impl_message, new_msg_id, BusConfig, BusError, Handle, Message, MessageBus, MessageHierarchy,
    MessageKind, MsgId, Subscription, MESSAGE,
};
use parking_lot::Mutex;
use test_timeout::timeout;

static ANIMAL: MessageKind = MessageKind::derived("zoo.Animal", &MESSAGE);
static DOG: MessageKind = MessageKind::derived("zoo.Dog", &ANIMAL);
static PUPPY: MessageKind = MessageKind::derived("zoo.Puppy", &DOG);
static CAT: MessageKind = MessageKind::derived("zoo.Cat", &ANIMAL);

#[derive(Debug)]
struct Animal {
    msg_id: MsgId,
}
impl_message!(Animal, &ANIMAL);

#[derive(Debug)]
struct Dog {
    animal: Animal,
    name: &'static str,
}
impl_message!(Dog, &DOG, base = animal);

#[derive(Debug)]
struct Puppy {
    dog: Dog,
    weeks: u32,
}
impl_message!(Puppy, &PUPPY, base = dog);

#[derive(Debug)]
struct Cat {
    animal: Animal,
}
impl_message!(Cat, &CAT, base = animal);

fn animal() -> Animal {
    Animal {
        msg_id: new_msg_id(),
    }
}

fn dog() -> Dog {
    Dog {
        animal: animal(),
        name: "rex",
    }
}

fn puppy() -> Puppy {
    Puppy {
        dog: Dog {
            animal: animal(),
            name: "bit",
        },
        weeks: 9,
    }
}

fn cat() -> Cat {
    Cat { animal: animal() }
}

/// Records the id of everything it receives.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<MsgId>>,
}

impl Recorder {
    fn seen(&self) -> Vec<MsgId> {
        self.seen.lock().clone()
    }
}

impl Handle<Dog> for Recorder {
    fn handle(&self, message: &Dog) {
        self.seen.lock().push(message.msg_id());
    }
}

impl Handle<Animal> for Recorder {
    fn handle(&self, message: &Animal) {
        self.seen.lock().push(message.msg_id());
    }
}

impl Handle<dyn Message> for Recorder {
    fn handle(&self, message: &dyn Message) {
        self.seen.lock().push(message.msg_id());
    }
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(&Dog) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let handle = {
        let count = count.clone();
        move |_: &Dog| {
            count.fetch_add(1, Ordering::SeqCst);
        }
    };
    (count, handle)
}

#[timeout(5)]
fn base_handler_receives_descendants_not_siblings() {
    let bus = MessageBus::standalone("zoo");
    let recorder = Arc::new(Recorder::default());
    let _subscription = bus
        .subscribe::<Dog, _>(recorder.clone())
        .expect("subscribe");

    let (dog, puppy, cat) = (dog(), puppy(), cat());
    bus.publish(&dog).expect("dog");
    bus.publish(&puppy).expect("puppy");
    bus.publish(&cat).expect("cat");

    assert_eq!(recorder.seen(), [dog.msg_id(), puppy.msg_id()]);
}

#[timeout(5)]
fn descendant_arrives_as_its_embedded_base() {
    let bus = MessageBus::standalone("views");
    let names: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let animals = Arc::new(AtomicUsize::new(0));
    let _dogs = bus
        .subscribe::<Dog, _>({
            let names = names.clone();
            Arc::new(move |dog: &Dog| names.lock().push(dog.name))
        })
        .expect("dogs");
    let _animals = bus
        .subscribe::<Animal, _>({
            let animals = animals.clone();
            Arc::new(move |_: &Animal| {
                animals.fetch_add(1, Ordering::SeqCst);
            })
        })
        .expect("animals");
    let _puppies = bus
        .subscribe::<Puppy, _>(Arc::new(|puppy: &Puppy| assert_eq!(puppy.weeks, 9)))
        .expect("puppies");

    bus.publish(&puppy()).expect("puppy");
    bus.publish(&dog()).expect("dog");
    bus.publish(&cat()).expect("cat");

    assert_eq!(*names.lock(), ["bit", "rex"]);
    assert_eq!(animals.load(Ordering::SeqCst), 3);
    assert_eq!(bus.stats().panicked, 0);
}

#[timeout(5)]
fn universal_subscription_sees_every_message() {
    let bus = MessageBus::standalone("all");
    let recorder = Arc::new(Recorder::default());
    let _subscription = bus
        .subscribe::<dyn Message, _>(recorder.clone())
        .expect("subscribe");

    let (cat, puppy) = (cat(), puppy());
    bus.publish(&cat).expect("cat");
    bus.publish(&puppy).expect("puppy");

    assert_eq!(recorder.seen(), [cat.msg_id(), puppy.msg_id()]);
}

#[timeout(5)]
fn subscribing_twice_registers_once() {
    let bus = MessageBus::standalone("dedup");
    let (count, handle) = counter();
    let handler = Arc::new(handle);

    bus.subscribe::<Dog, _>(handler.clone()).expect("first").detach();
    bus.subscribe::<Dog, _>(handler.clone()).expect("second").detach();
    assert_eq!(bus.subscription_count(), 1);

    bus.publish(&dog()).expect("publish");
    assert_eq!(count.load(Ordering::SeqCst), 1);

    bus.unsubscribe::<Dog, _>(&handler).expect("unsubscribe");
    assert!(!bus.has_subscriber_for::<Dog>(true));
    bus.publish(&dog()).expect("publish");
    assert_eq!(count.load(Ordering::SeqCst), 1);

    bus.unsubscribe::<Dog, _>(&handler).expect("second unsubscribe is a no-op");
}

#[timeout(5)]
fn one_handler_for_two_types_is_two_registrations() {
    let bus = MessageBus::standalone("two-types");
    let recorder = Arc::new(Recorder::default());
    let _dog = bus.subscribe::<Dog, _>(recorder.clone()).expect("dog");
    let _animal = bus.subscribe::<Animal, _>(recorder.clone()).expect("animal");
    assert_eq!(bus.subscription_count(), 2);

    let puppy = puppy();
    bus.publish(&puppy).expect("puppy");
    assert_eq!(recorder.seen(), [puppy.msg_id(), puppy.msg_id()]);

    bus.publish(&animal()).expect("animal");
    assert_eq!(recorder.seen().len(), 3);
}

#[timeout(5)]
fn publishing_without_subscribers_is_fine() {
    let bus = MessageBus::standalone("empty");
    bus.publish(&cat()).expect("publish");
    assert_eq!(bus.stats().unhandled, 1);
}

#[timeout(5)]
fn has_subscriber_for_distinguishes_exact_and_derived() {
    let bus = MessageBus::standalone("lookup");
    let recorder = Arc::new(Recorder::default());
    let _subscription = bus.subscribe::<Animal, _>(recorder).expect("subscribe");
    bus.registry().register(&DOG);

    assert!(bus.has_subscriber_for::<Animal>(false));
    assert!(!bus.has_subscriber_for::<Dog>(false));
    assert!(bus.has_subscriber_for::<Dog>(true));
    assert!(!bus.has_subscriber_for::<Cat>(true), "cat never registered");
}

#[timeout(5)]
fn registry_growth_reaches_existing_subscriptions() {
    static FOX: MessageKind = MessageKind::derived("zoo.Fox", &ANIMAL);
    #[derive(Debug)]
    struct Fox {
        animal: Animal,
    }
    impl_message!(Fox, &FOX, base = animal);

    let registry = MessageHierarchy::new();
    let first = MessageBus::new("first", registry.clone(), BusConfig::default());
    let second = MessageBus::new("second", registry.clone(), BusConfig::default());
    let recorder = Arc::new(Recorder::default());
    let _subscription = first
        .subscribe::<Animal, _>(recorder.clone())
        .expect("subscribe");

    // the kind is first seen on the other bus
    second
        .publish(&Fox { animal: animal() })
        .expect("fox on second");
    let fox = Fox { animal: animal() };
    first.publish(&fox).expect("fox on first");

    assert_eq!(recorder.seen(), [fox.msg_id()]);
}

#[timeout(5)]
fn dropping_the_token_unsubscribes() {
    let bus = MessageBus::standalone("token");
    let (count, handle) = counter();
    let subscription = bus.subscribe::<Dog, _>(Arc::new(handle)).expect("subscribe");
    bus.publish(&dog()).expect("publish");
    drop(subscription);
    bus.publish(&dog()).expect("publish");
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(bus.subscription_count(), 0);
}

#[timeout(5)]
fn disposed_bus_rejects_everything() {
    let bus = MessageBus::standalone("gone");
    let (count, handle) = counter();
    let handler = Arc::new(handle);
    let subscription = bus.subscribe::<Dog, _>(handler.clone()).expect("subscribe");

    bus.dispose();
    bus.dispose();
    assert!(bus.is_disposed());
    assert!(matches!(bus.publish(&dog()), Err(BusError::Disposed { .. })));
    assert!(matches!(
        bus.subscribe::<Dog, _>(handler.clone()),
        Err(BusError::Disposed { .. })
    ));
    assert!(matches!(
        bus.unsubscribe::<Dog, _>(&handler),
        Err(BusError::Disposed { .. })
    ));
    assert!(!bus.has_subscriber_for::<Dog>(true));
    drop(subscription);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[timeout(5)]
fn panicking_handler_does_not_starve_the_rest() {
    let bus = MessageBus::standalone("panics");
    let exploding = Arc::new(|_: &Dog| panic!("handler exploded"));
    let (count, handle) = counter();
    let _first = bus.subscribe::<Dog, _>(exploding).expect("exploding");
    let _second = bus.subscribe::<Dog, _>(Arc::new(handle)).expect("counter");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| bus.publish(&dog())));
    assert!(outcome.is_err(), "the panic reaches the publisher");
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(bus.stats().panicked, 1);

    // the bus stays usable
    let _ = panic::catch_unwind(AssertUnwindSafe(|| bus.publish(&dog())));
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[timeout(5)]
fn slow_handlers_are_counted() {
    let config = BusConfig {
        watch_slow: true,
        slow_threshold: Duration::from_millis(1),
        very_slow_threshold: Duration::from_secs(60),
    };
    let bus = MessageBus::new("slow", MessageHierarchy::new(), config);
    let sleepy = Arc::new(|_: &Dog| std::thread::sleep(Duration::from_millis(10)));
    let _subscription = bus.subscribe::<Dog, _>(sleepy).expect("subscribe");

    bus.publish(&dog()).expect("publish");
    let stats = bus.stats();
    assert_eq!(stats.slow, 1);
    assert_eq!(stats.very_slow, 0);
    assert!(stats.max_handler_ns >= 10_000_000);
}

#[timeout(5)]
fn handlers_may_change_subscriptions_while_dispatching() {
    let bus = MessageBus::standalone("reentrant");
    let late = Arc::new(Recorder::default());
    let tokens: Arc<Mutex<Vec<Subscription>>> = Arc::default();
    let subscriber = {
        let bus = Arc::downgrade(&bus);
        let late = late.clone();
        let tokens = tokens.clone();
        Arc::new(move |_: &Dog| {
            if let Some(bus) = bus.upgrade() {
                let token = bus.subscribe::<Dog, _>(late.clone()).expect("nested subscribe");
                tokens.lock().push(token);
            }
        })
    };
    let _subscription = bus.subscribe::<Dog, _>(subscriber).expect("subscribe");

    // the nested registration lands in the next snapshot, not this dispatch
    bus.publish(&dog()).expect("first");
    assert!(late.seen().is_empty());
    let second = dog();
    bus.publish(&second).expect("second");
    assert_eq!(late.seen(), [second.msg_id()]);
}

#[timeout(10)]
fn concurrent_publishers_and_subscribers() {
    let bus = MessageBus::standalone("busy");
    let (count, handle) = counter();
    let _subscription = bus.subscribe::<Dog, _>(Arc::new(handle)).expect("subscribe");

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..250 {
                    bus.publish(&dog()).expect("publish");
                }
            });
        }
        scope.spawn(|| {
            for _ in 0..100 {
                let recorder = Arc::new(Recorder::default());
                let token = bus.subscribe::<Dog, _>(recorder).expect("churn");
                drop(token);
            }
        });
    });

    assert_eq!(count.load(Ordering::SeqCst), 1000);
    assert_eq!(bus.subscription_count(), 1);
}
