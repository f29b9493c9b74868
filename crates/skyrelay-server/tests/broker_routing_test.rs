//! Routing behaviour of the broker, driven through events only.
//!
//! Covers client subscriptions, BLOB policy, snoops between drivers, chained
//! brokers and remote link deduplication.

mod common;

use common::Harness;

const TEMPERATURE: &str = "<setNumberVector device='Camera' name='CCD_TEMPERATURE' state='Ok'>\
                           <oneNumber name='CCD_TEMPERATURE_VALUE'>-10</oneNumber></setNumberVector>";

#[test]
fn subscribed_clients_get_exactly_one_copy() {
    let mut h = Harness::with_defaults();
    let camera = h.driver("indi_camera");
    let (a, b, c) = (h.client(), h.client(), h.client());

    h.send(a, "<getProperties version='1.7'/>");
    h.send(b, "<getProperties version='1.7' device='Camera'/>");
    assert_eq!(h.take(camera), "<getProperties version='1.7'/>");

    h.send(camera, TEMPERATURE);

    assert_eq!(h.take(a), TEMPERATURE);
    assert_eq!(h.take(b), TEMPERATURE);
    assert_eq!(h.take(c), "");
}

#[test]
fn blob_only_policy_suppresses_plain_updates() {
    let mut h = Harness::with_defaults();
    let camera = h.driver("indi_camera");
    let client = h.client();

    h.send(client, "<enableBLOB device='Camera' name='CCD1'>Only</enableBLOB>");

    h.send(camera, "<setSwitchVector device='Camera' name='CCD1'><oneSwitch name='ON'>On</oneSwitch></setSwitchVector>");
    assert_eq!(h.take(client), "");

    let blob = "<setBLOBVector device='Camera' name='CCD1'>\
                <oneBLOB name='CCD1' size='3' format='.fits'>AAAA</oneBLOB></setBLOBVector>";
    h.send(camera, blob);
    assert_eq!(h.take(client), blob);
}

#[test]
fn blobs_are_off_by_default() {
    let mut h = Harness::with_defaults();
    let camera = h.driver("indi_camera");
    let client = h.client();
    h.send(client, "<getProperties version='1.7' device='Camera'/>");

    h.send(camera, "<setBLOBVector device='Camera' name='CCD1'><oneBLOB name='CCD1' format='.fits'>AAAA</oneBLOB></setBLOBVector>");
    assert_eq!(h.take(client), "");

    h.send(client, "<enableBLOB device='Camera'>Also</enableBLOB>");
    h.send(camera, "<setBLOBVector device='Camera' name='CCD1'><oneBLOB name='CCD1' format='.fits'>BBBB</oneBLOB></setBLOBVector>");
    assert!(h.take(client).contains("BBBB"));
}

#[test]
fn snoop_request_registers_once_and_reaches_owner() {
    let mut h = Harness::with_defaults();
    let mount = h.driver("indi_mount");
    let guider = h.driver("indi_guider");

    h.send(mount, "<defNumberVector device='Mount' name='EQUATORIAL_EOD_COORD'><defNumber name='RA'>0</defNumber></defNumberVector>");
    assert_eq!(h.take(mount), "");

    let snoop = "<getProperties device='Mount' name='EQUATORIAL_EOD_COORD'/>";
    h.send(guider, snoop);
    h.send(guider, snoop);

    assert_eq!(h.take(mount), format!("{snoop}{snoop}"));
    assert_eq!(h.broker.driver(guider).unwrap().snoops().len(), 1);

    let coords = "<setNumberVector device='Mount' name='EQUATORIAL_EOD_COORD'><oneNumber name='RA'>5.5</oneNumber></setNumberVector>";
    h.send(mount, coords);
    assert_eq!(h.take(guider), coords);

    h.send(mount, "<setNumberVector device='Mount' name='TELESCOPE_INFO'><oneNumber name='APERTURE'>200</oneNumber></setNumberVector>");
    assert_eq!(h.take(guider), "");
}

#[test]
fn device_ownership_sticks_to_first_driver() {
    let mut h = Harness::with_defaults();
    let camera = h.driver("indi_camera");
    let focuser = h.driver("indi_focuser");
    let client = h.client();

    h.send(camera, TEMPERATURE);
    for i in 0..20 {
        h.send(focuser, &format!("<setNumberVector device='Focuser' name='POS'><oneNumber name='P'>{i}</oneNumber></setNumberVector>"));
    }

    let request = "<newNumberVector device='Camera' name='CCD_TEMPERATURE'><oneNumber name='CCD_TEMPERATURE_VALUE'>-20</oneNumber></newNumberVector>";
    h.send(client, request);
    assert_eq!(h.take(camera), request);
    assert_eq!(h.take(focuser), "");
}

#[test]
fn new_requests_echo_to_other_interested_clients() {
    let mut h = Harness::with_defaults();
    let camera = h.driver("indi_camera");
    let (sender, watcher, bystander) = (h.client(), h.client(), h.client());

    h.send(camera, TEMPERATURE);
    h.send(watcher, "<getProperties version='1.7'/>");
    h.take(watcher);
    h.take(camera);

    let request = "<newSwitchVector device='Camera' name='COOLER'><oneSwitch name='COOLER_ON'>On</oneSwitch></newSwitchVector>";
    h.send(sender, request);

    assert_eq!(h.take(camera), request);
    assert_eq!(h.take(watcher), request);
    assert_eq!(h.take(sender), "");
    assert_eq!(h.take(bystander), "");
}

#[test]
fn ping_is_answered_to_sender_only() {
    let mut h = Harness::with_defaults();
    let camera = h.driver("indi_camera");
    let (client, other) = (h.client(), h.client());
    h.send(other, "<getProperties version='1.7'/>");
    h.take(camera);

    h.send(client, "<pingRequest uid='42'/>");
    assert_eq!(h.take(client), "<pingReply uid='42'/>");
    assert_eq!(h.take(camera), "");
    assert_eq!(h.take(other), "");

    h.send(camera, "<pingRequest uid='7'/>");
    assert_eq!(h.take(camera), "<pingReply uid='7'/>");
    assert_eq!(h.take(other), "");
}

#[test]
fn upstream_brokers_relay_snoop_requests() {
    let mut h = Harness::with_defaults();
    let camera = h.driver("indi_camera");
    let guider = h.driver("indi_guider");
    let (upstream, everything, subscriber) = (h.client(), h.client(), h.client());

    h.send(upstream, "<getProperties device='*' version='1.7'/>");
    assert_eq!(h.take(camera), "<getProperties device='*' version='1.7'/>");
    h.send(everything, "<getProperties version='1.7'/>");

    h.send(guider, "<defTextVector device='Guider' name='INFO'><defText name='T'>x</defText></defTextVector>");
    h.send(subscriber, "<getProperties version='1.7' device='Guider'/>");
    for conn in [upstream, everything, subscriber, guider] {
        h.take(conn);
    }

    let snoop = "<getProperties device='Remote Mount' name='EQUATORIAL_EOD_COORD'/>";
    h.send(guider, snoop);
    assert_eq!(h.take(upstream), snoop);
    assert_eq!(h.take(subscriber), snoop);
    assert_eq!(h.take(everything), "");

    // The chained broker's set traffic reaches the snooping driver
    let coords = "<setNumberVector device='Remote Mount' name='EQUATORIAL_EOD_COORD'><oneNumber name='RA'>1</oneNumber></setNumberVector>";
    h.send(upstream, coords);
    assert_eq!(h.take(guider), coords);
}

#[test]
fn deviceless_requests_reach_each_remote_broker_once() {
    let mut h = Harness::with_defaults();
    let chained = h.driver("@observatory:7624");
    let camera_link = h.driver("Cam@observatory:7624");
    let local = h.driver("indi_focuser");
    let client = h.client();

    h.send(client, "<getProperties version='1.7'/>");
    assert_eq!(h.take(chained), "<getProperties version='1.7'/>");
    assert_eq!(h.take(camera_link), "");
    assert_eq!(h.take(local), "<getProperties version='1.7'/>");
}

#[test]
fn enable_blob_only_goes_to_remote_links() {
    let mut h = Harness::with_defaults();
    let camera_link = h.driver("Cam@observatory:7624");
    let local = h.driver("indi_camera");
    h.send(local, "<defTextVector device='Cam' name='INFO'><defText name='T'>x</defText></defTextVector>");
    let client = h.client();

    h.send(client, "<enableBLOB device='Cam'>Also</enableBLOB>");
    assert_eq!(h.take(camera_link), "<enableBLOB device='Cam'>Also</enableBLOB>");
    assert_eq!(h.take(local), "");
}

#[test]
fn input_split_across_reads_is_reassembled() {
    let mut h = Harness::with_defaults();
    let camera = h.driver("indi_camera");
    let client = h.client();
    h.send(client, "<getProperties version='1.7'/>");

    let (head, tail) = TEMPERATURE.split_at(37);
    h.send(camera, head);
    assert_eq!(h.take(client), "");
    h.send(camera, tail);
    assert_eq!(h.take(client), TEMPERATURE);
}
