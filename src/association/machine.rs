//! The upper layer protocol state machine.
//!
//! The machine tracks one side of an association through the
//! thirteen states of PS3.8 table 9-10.
//! It is a pure control component:
//! [`Machine::step`] maps the current state and an incoming [`Event`]
//! to a list of [`Action`]s and the next state,
//! while the surrounding driver owns the socket and the payloads.
//!
//! Release collisions are resolved by role:
//! the association requestor runs Sta7 → Sta9 → Sta11 and
//! completes first, while the acceptor runs Sta7 → Sta10 → Sta12 → Sta13.

/// The side of the association this machine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// the node which requested the association
    Requestor,
    /// the node which accepted the connection
    Acceptor,
}

/// The thirteen states of PS3.8 table 9-10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// idle, no connection
    Sta1,
    /// (acceptor) transport open, awaiting A-ASSOCIATE-RQ
    Sta2,
    /// (acceptor) awaiting local accept/reject decision
    Sta3,
    /// (requestor) awaiting transport connection
    Sta4,
    /// (requestor) A-ASSOCIATE-RQ sent, awaiting AC/RJ
    Sta5,
    /// association established, data transfer
    Sta6,
    /// A-RELEASE-RQ sent, awaiting A-RELEASE-RP
    Sta7,
    /// A-RELEASE-RQ received, awaiting local response
    Sta8,
    /// release collision, requestor awaiting local response
    Sta9,
    /// release collision, acceptor awaiting A-RELEASE-RP
    Sta10,
    /// release collision, requestor awaiting A-RELEASE-RP
    Sta11,
    /// release collision, acceptor awaiting local response
    Sta12,
    /// association terminated, awaiting transport close
    Sta13,
}

/// An input to the state machine:
/// either a local service request or a network indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// local request to open an association (requestor)
    AssociateRequest,
    /// the transport connection is open
    TransportConnected,
    /// an A-ASSOCIATE-RQ PDU arrived
    AssociateRqReceived,
    /// an A-ASSOCIATE-AC PDU arrived
    AssociateAcReceived,
    /// an A-ASSOCIATE-RJ PDU arrived
    AssociateRjReceived,
    /// local decision to accept the association (acceptor)
    AssociateResponseAccept,
    /// local decision to reject the association (acceptor)
    AssociateResponseReject,
    /// local request to send P-DATA
    PDataRequest,
    /// a P-DATA-TF PDU arrived
    PDataReceived,
    /// local request to release the association
    ReleaseRequest,
    /// an A-RELEASE-RQ PDU arrived
    ReleaseRqReceived,
    /// local response to a release indication
    ReleaseResponse,
    /// an A-RELEASE-RP PDU arrived
    ReleaseRpReceived,
    /// local request to abort the association
    AbortRequest,
    /// an A-ABORT PDU arrived
    AbortReceived,
    /// the transport connection was closed by the peer
    TransportClosed,
    /// an undecodable PDU arrived
    InvalidPduReceived,
}

/// An output of the state machine, to be performed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// send the pending A-ASSOCIATE-RQ
    SendAssociateRq,
    /// send the pending A-ASSOCIATE-AC
    SendAssociateAc,
    /// send the pending A-ASSOCIATE-RJ
    SendAssociateRj,
    /// send the pending P-DATA-TF
    SendPData,
    /// send an A-RELEASE-RQ
    SendReleaseRq,
    /// send an A-RELEASE-RP
    SendReleaseRp,
    /// send an A-ABORT
    SendAbort,
    /// signal upward that the association is established
    NotifyEstablished,
    /// signal upward that the association request was rejected
    NotifyRejected,
    /// signal upward that P-DATA arrived
    NotifyData,
    /// signal upward that the association released cleanly
    NotifyReleased,
    /// signal upward that the association was aborted
    NotifyAborted,
    /// close the transport connection
    CloseTransport,
}

/// One side of an association,
/// tracked through the states of PS3.8 table 9-10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Machine {
    role: Role,
    state: State,
}

impl Machine {
    /// Create a machine in the idle state.
    pub fn new(role: Role) -> Self {
        Machine {
            role,
            state: State::Sta1,
        }
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The role this machine plays.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the association is in the data transfer state.
    pub fn is_established(&self) -> bool {
        self.state == State::Sta6
    }

    /// Apply one event, returning the actions the driver must perform.
    ///
    /// The machine never fails: events which are not acceptable in the
    /// current state produce the abort path of table 9-10
    /// (send A-ABORT, signal `Aborted` upward, go to Sta13).
    pub fn step(&mut self, event: Event) -> Vec<Action> {
        use Action::*;
        use Event::*;
        use State::*;

        let (actions, next) = match (self.state, event) {
            // establishment, requestor side
            (Sta1, AssociateRequest) => (vec![], Sta4),
            (Sta4, TransportConnected) => (vec![SendAssociateRq], Sta5),
            (Sta4, TransportClosed) => (vec![NotifyAborted], Sta1),
            (Sta4, AbortRequest) => (vec![CloseTransport], Sta1),
            (Sta5, AssociateAcReceived) => (vec![NotifyEstablished], Sta6),
            (Sta5, AssociateRjReceived) => (vec![NotifyRejected, CloseTransport], Sta1),

            // establishment, acceptor side
            (Sta1, TransportConnected) => (vec![], Sta2),
            (Sta2, AssociateRqReceived) => (vec![], Sta3),
            (Sta2, AbortReceived) => (vec![CloseTransport], Sta1),
            (Sta2, TransportClosed) => (vec![CloseTransport], Sta1),
            (Sta3, AssociateResponseAccept) => (vec![SendAssociateAc, NotifyEstablished], Sta6),
            (Sta3, AssociateResponseReject) => (vec![SendAssociateRj], Sta13),

            // data transfer
            (Sta6, PDataRequest) => (vec![SendPData], Sta6),
            (Sta6, PDataReceived) => (vec![NotifyData], Sta6),

            // release
            (Sta6, ReleaseRequest) => (vec![SendReleaseRq], Sta7),
            (Sta6, ReleaseRqReceived) => (vec![], Sta8),
            (Sta7, PDataReceived) => (vec![NotifyData], Sta7),
            (Sta7, ReleaseRpReceived) => (vec![NotifyReleased, CloseTransport], Sta1),
            (Sta7, ReleaseRqReceived) => match self.role {
                Role::Requestor => (vec![], Sta9),
                Role::Acceptor => (vec![], Sta10),
            },
            (Sta8, PDataRequest) => (vec![SendPData], Sta8),
            (Sta8, ReleaseResponse) => {
                (vec![SendReleaseRp, NotifyReleased, CloseTransport], Sta13)
            }
            (Sta9, ReleaseResponse) => (vec![SendReleaseRp], Sta11),
            (Sta10, ReleaseRpReceived) => (vec![], Sta12),
            (Sta11, ReleaseRpReceived) => (vec![NotifyReleased, CloseTransport], Sta1),
            (Sta12, ReleaseResponse) => {
                (vec![SendReleaseRp, NotifyReleased, CloseTransport], Sta13)
            }

            // abort paths common to every active state
            (Sta13, TransportClosed) => (vec![CloseTransport], Sta1),
            (Sta13, _) => (vec![], Sta13),
            (_, AbortRequest) => (vec![SendAbort, CloseTransport], Sta13),
            (_, AbortReceived) => (vec![NotifyAborted, CloseTransport], Sta1),
            (_, TransportClosed) => (vec![NotifyAborted], Sta1),
            (_, InvalidPduReceived) => (vec![SendAbort, NotifyAborted, CloseTransport], Sta13),

            // any other PDU or request is a protocol violation
            (_, _) => (vec![SendAbort, NotifyAborted, CloseTransport], Sta13),
        };

        self.state = next;
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::Action::*;
    use super::Event::*;
    use super::State::*;
    use super::*;

    #[test]
    fn requestor_establishment() {
        let mut m = Machine::new(Role::Requestor);
        assert_eq!(m.step(AssociateRequest), vec![]);
        assert_eq!(m.state(), Sta4);
        assert_eq!(m.step(TransportConnected), vec![SendAssociateRq]);
        assert_eq!(m.state(), Sta5);
        assert_eq!(m.step(AssociateAcReceived), vec![NotifyEstablished]);
        assert!(m.is_established());
    }

    #[test]
    fn requestor_rejection() {
        let mut m = Machine::new(Role::Requestor);
        m.step(AssociateRequest);
        m.step(TransportConnected);
        assert_eq!(
            m.step(AssociateRjReceived),
            vec![NotifyRejected, CloseTransport]
        );
        assert_eq!(m.state(), Sta1);
    }

    #[test]
    fn acceptor_establishment() {
        let mut m = Machine::new(Role::Acceptor);
        assert_eq!(m.step(TransportConnected), vec![]);
        assert_eq!(m.state(), Sta2);
        assert_eq!(m.step(AssociateRqReceived), vec![]);
        assert_eq!(m.state(), Sta3);
        assert_eq!(
            m.step(AssociateResponseAccept),
            vec![SendAssociateAc, NotifyEstablished]
        );
        assert!(m.is_established());
    }

    #[test]
    fn acceptor_rejection_path() {
        let mut m = Machine::new(Role::Acceptor);
        m.step(TransportConnected);
        m.step(AssociateRqReceived);
        assert_eq!(m.step(AssociateResponseReject), vec![SendAssociateRj]);
        assert_eq!(m.state(), Sta13);
    }

    #[test]
    fn data_transfer_loops_in_sta6() {
        let mut m = established(Role::Requestor);
        assert_eq!(m.step(PDataRequest), vec![SendPData]);
        assert_eq!(m.step(PDataReceived), vec![NotifyData]);
        assert_eq!(m.state(), Sta6);
    }

    #[test]
    fn orderly_release_from_requestor() {
        let mut m = established(Role::Requestor);
        assert_eq!(m.step(ReleaseRequest), vec![SendReleaseRq]);
        assert_eq!(m.state(), Sta7);
        // data may still arrive while the release is pending
        assert_eq!(m.step(PDataReceived), vec![NotifyData]);
        assert_eq!(
            m.step(ReleaseRpReceived),
            vec![NotifyReleased, CloseTransport]
        );
        assert_eq!(m.state(), Sta1);
    }

    #[test]
    fn orderly_release_from_peer() {
        let mut m = established(Role::Acceptor);
        assert_eq!(m.step(ReleaseRqReceived), vec![]);
        assert_eq!(m.state(), Sta8);
        assert_eq!(
            m.step(ReleaseResponse),
            vec![SendReleaseRp, NotifyReleased, CloseTransport]
        );
        assert_eq!(m.state(), Sta13);
    }

    #[test]
    fn release_collision_requestor_completes_first() {
        let mut m = established(Role::Requestor);
        m.step(ReleaseRequest);
        assert_eq!(m.step(ReleaseRqReceived), vec![]);
        assert_eq!(m.state(), Sta9);
        assert_eq!(m.step(ReleaseResponse), vec![SendReleaseRp]);
        assert_eq!(m.state(), Sta11);
        assert_eq!(
            m.step(ReleaseRpReceived),
            vec![NotifyReleased, CloseTransport]
        );
        assert_eq!(m.state(), Sta1);
    }

    #[test]
    fn release_collision_acceptor_waits_for_peer() {
        let mut m = established(Role::Acceptor);
        m.step(ReleaseRequest);
        assert_eq!(m.step(ReleaseRqReceived), vec![]);
        assert_eq!(m.state(), Sta10);
        assert_eq!(m.step(ReleaseRpReceived), vec![]);
        assert_eq!(m.state(), Sta12);
        assert_eq!(
            m.step(ReleaseResponse),
            vec![SendReleaseRp, NotifyReleased, CloseTransport]
        );
        assert_eq!(m.state(), Sta13);
    }

    #[test]
    fn unexpected_pdu_aborts() {
        let mut m = established(Role::Requestor);
        assert_eq!(
            m.step(AssociateAcReceived),
            vec![SendAbort, NotifyAborted, CloseTransport]
        );
        assert_eq!(m.state(), Sta13);
    }

    #[test]
    fn invalid_pdu_aborts() {
        let mut m = established(Role::Acceptor);
        assert_eq!(
            m.step(InvalidPduReceived),
            vec![SendAbort, NotifyAborted, CloseTransport]
        );
        assert_eq!(m.state(), Sta13);
    }

    #[test]
    fn transport_loss_is_an_abort() {
        let mut m = established(Role::Requestor);
        assert_eq!(m.step(TransportClosed), vec![NotifyAborted]);
        assert_eq!(m.state(), Sta1);
    }

    #[test]
    fn local_abort_sends_abort_pdu() {
        let mut m = established(Role::Requestor);
        assert_eq!(m.step(AbortRequest), vec![SendAbort, CloseTransport]);
        assert_eq!(m.state(), Sta13);
    }

    #[test]
    fn sta13_ignores_traffic_until_close() {
        let mut m = established(Role::Requestor);
        m.step(AbortRequest);
        assert_eq!(m.step(PDataReceived), vec![]);
        assert_eq!(m.state(), Sta13);
        assert_eq!(m.step(TransportClosed), vec![CloseTransport]);
        assert_eq!(m.state(), Sta1);
    }

    fn established(role: Role) -> Machine {
        let mut m = Machine::new(role);
        match role {
            Role::Requestor => {
                m.step(AssociateRequest);
                m.step(TransportConnected);
                m.step(AssociateAcReceived);
            }
            Role::Acceptor => {
                m.step(TransportConnected);
                m.step(AssociateRqReceived);
                m.step(AssociateResponseAccept);
            }
        }
        assert!(m.is_established());
        m
    }
}
